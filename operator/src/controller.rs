//! Reconciliation core for the LoadTest custom resource.
//!
//! Change notifications flow from the watch caches through the event routers
//! into the work queue; worker tasks pull keys and run [`Controller::sync_handler`],
//! which converges cluster state toward the declared test and mirrors the
//! observed state back into the status subresource.
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{Namespace, Pod},
    },
    chrono::{DateTime, Utc},
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    client::Client,
    core::ObjectMeta,
    runtime::{
        events::{Event as PlatformEvent, EventType, Recorder, Reporter},
        watcher,
    },
    Resource, ResourceExt,
};
use tokio::{
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout_at, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    backends::{Backend, BackendError, Registry},
    config::Config,
    informer::{spawn_informer, wait_for_cache_sync, RawEvent, Store, Tombstone},
    labels::{CONTROLLER_LABEL, MANAGED_BY_LABEL_SELECTOR},
    loadtest::{split_work_key, LoadTest, LoadTestPhase},
    metrics::MetricsReporter,
    queue::WorkQueue,
    utils::{Clock, UtcClock},
    CONTROLLER_NAME,
};

/// Delay before restarting a worker task that exited unexpectedly.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from the Kubernetes API; retryable.
    #[error("kube error: {source}")]
    Kube {
        /// Underlying client error.
        #[from]
        source: kube::Error,
    },
    /// Application error; retryable.
    #[error("app error: {source}")]
    App {
        /// Underlying error.
        #[from]
        source: anyhow::Error,
    },
    /// The per-reconcile deadline elapsed; retryable.
    #[error("reconcile deadline exceeded")]
    DeadlineExceeded(#[from] tokio::time::error::Elapsed),
    /// Failure that no retry will resolve; the key is dropped from the queue.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl Error {
    /// True when retrying cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Kube(source) => Error::Kube { source },
            BackendError::Permanent(err) => Error::Permanent(err.to_string()),
            BackendError::Other(source) => Error::App { source },
        }
    }
}

/// Controller for LoadTest resources.
pub struct Controller<C = UtcClock> {
    cfg: Config,
    client: Client,
    registry: Registry,
    load_tests: Arc<Store<LoadTest>>,
    jobs: Arc<Store<Job>>,
    pods: Arc<Store<Pod>>,
    queue: Arc<WorkQueue<String>>,
    metrics: MetricsReporter,
    reporter: Reporter,
    clock: C,
}

impl Controller<UtcClock> {
    /// Create a controller using the real clock.
    pub fn new(
        cfg: Config,
        client: Client,
        registry: Registry,
        metrics: MetricsReporter,
    ) -> Arc<Self> {
        Arc::new(Self::with_clock(cfg, client, registry, metrics, UtcClock))
    }
}

impl<C> Controller<C>
where
    C: Clock + 'static,
{
    fn with_clock(
        cfg: Config,
        client: Client,
        registry: Registry,
        metrics: MetricsReporter,
        clock: C,
    ) -> Self {
        Self {
            cfg,
            client,
            registry,
            load_tests: Arc::new(Store::default()),
            jobs: Arc::new(Store::default()),
            pods: Arc::new(Store::default()),
            queue: Arc::new(WorkQueue::new()),
            metrics,
            reporter: Reporter {
                controller: CONTROLLER_NAME.into(),
                instance: None,
            },
            clock,
        }
    }

    /// Run the controller until the shutdown future resolves.
    ///
    /// Starts the informers, waits for their caches to sync, then launches
    /// `workers` concurrent worker tasks. On shutdown the queue is closed and
    /// in-flight reconciles are allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        shutdown: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        info!("starting loadtest controller");
        let informers = self.clone().spawn_informers();
        tokio::pin!(shutdown);

        debug!("waiting for informer caches to sync");
        let synced = vec![
            self.load_tests.synced(),
            self.jobs.synced(),
            self.pods.synced(),
        ];
        tokio::select! {
            res = wait_for_cache_sync(synced) => {
                if let Err(err) = res {
                    for informer in informers {
                        informer.abort();
                    }
                    return Err(err);
                }
            }
            _ = &mut shutdown => {
                for informer in informers {
                    informer.abort();
                }
                return Ok(());
            }
        }

        debug!(workers, "starting workers");
        let mut worker_set = JoinSet::new();
        for index in 0..workers {
            worker_set.spawn(self.clone().supervise_worker(index));
        }

        (&mut shutdown).await;
        debug!("shutting down workers");
        self.queue.shut_down();
        while worker_set.join_next().await.is_some() {}
        for informer in informers {
            informer.abort();
        }
        Ok(())
    }

    // Keep a worker running until the queue shuts down, restarting it after a
    // short delay when it panics.
    async fn supervise_worker(self: Arc<Self>, index: usize) {
        loop {
            let controller = self.clone();
            let worker = tokio::spawn(async move { controller.run_worker().await });
            match worker.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    error!(worker = index, "worker panicked, restarting");
                    sleep(WORKER_RESTART_DELAY).await;
                }
                Err(_) => break,
            }
        }
    }

    async fn run_worker(self: Arc<Self>) {
        while self.process_next_work_item().await {}
    }

    /// Pull one key off the queue and reconcile it.
    ///
    /// Returns false once the queue has shut down. Instruments are recorded
    /// here, not in the reconciler, so they fire for every attempt.
    pub(crate) async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.observe_queue_depth(self.queue.len());

        let start = Instant::now();
        // The queue must learn the key is no longer in flight on every exit
        // path, panics included.
        let _done = DoneGuard {
            queue: self.queue.as_ref(),
            key: key.clone(),
        };

        let result = self.sync_handler(&key).await;
        let success = result.is_ok();
        match result {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(loadtest = %key, "successfully synced");
            }
            Err(err) if err.is_permanent() => {
                self.queue.forget(&key);
                error!(loadtest = %key, error = %err, "dropping loadtest from queue");
            }
            Err(err) => {
                self.queue.add_rate_limited(key.clone());
                error!(loadtest = %key, error = %err, "error syncing loadtest, re-queuing");
            }
        }
        self.metrics
            .observe_reconcile(&key, success, start.elapsed());
        true
    }

    /// Compare the actual state of the keyed LoadTest with the desired state
    /// and attempt to converge the two.
    pub(crate) async fn sync_handler(&self, key: &str) -> Result<(), Error> {
        let deadline = Instant::now() + self.cfg.sync_handler_timeout;
        let name = split_work_key(key);

        let Some(cached) = self.load_tests.get(name) else {
            // Deleted between enqueue and processing; reconciling a missing
            // object is a no-op.
            info!(loadtest = %key, "loadtest in work queue no longer exists");
            return Ok(());
        };
        // Copy the object before mutating it; the cache is read-only.
        let mut load_test = cached.clone();

        let report_url = build_report_url(&self.cfg.kangal_proxy_url, name);

        let backend = self
            .registry
            .get(&load_test.spec.backend_type)
            .map_err(|err| Error::Permanent(format!("failed to resolve backend: {err}")))?;

        let result = self
            .sync_load_test(deadline, &mut load_test, backend.as_ref(), &report_url)
            .await;

        // The status write is attempted whether the sync succeeded or not.
        self.update_load_test_status(deadline, key, &load_test, &cached)
            .await;

        result
    }

    async fn sync_load_test(
        &self,
        deadline: Instant,
        load_test: &mut LoadTest,
        backend: &dyn Backend,
        report_url: &str,
    ) -> Result<(), Error> {
        self.check_or_create_namespace(deadline, load_test).await?;

        timeout_at(deadline, backend.sync(load_test, report_url)).await??;

        let mut status = load_test.status.take().unwrap_or_default();
        let result = timeout_at(deadline, backend.sync_status(load_test, &mut status)).await;
        load_test.status = Some(status);
        result??;

        if !self.cfg.clean_up_threshold.is_zero()
            && lifetime_exceeded(load_test, self.cfg.clean_up_threshold, self.clock.now())
        {
            info!(
                loadtest = %load_test.name_any(),
                phase = %load_test.status_or_default().phase,
                "deleting loadtest due to exceeded lifetime"
            );
            self.delete_load_test(deadline, load_test).await;
        }
        Ok(())
    }

    // Persist the status subresource when the phase changed during this
    // reconcile. Conflicts indicate a stale cache and are swallowed; the next
    // watch event re-reconciles.
    async fn update_load_test_status(
        &self,
        deadline: Instant,
        key: &str,
        load_test: &LoadTest,
        cached: &LoadTest,
    ) {
        let new_phase = load_test.status_or_default().phase;
        let cached_phase = cached.status_or_default().phase;
        if new_phase == cached_phase {
            return;
        }
        debug!(
            loadtest = %key,
            new_phase = %new_phase,
            previous_phase = %cached_phase,
            "updating loadtest status"
        );

        let api: Api<LoadTest> = Api::all(self.client.clone());
        let data = match serde_json::to_vec(load_test) {
            Ok(data) => data,
            Err(err) => {
                error!(error = %err, "failed serializing loadtest status");
                return;
            }
        };
        match timeout_at(
            deadline,
            api.replace_status(&load_test.name_any(), &PostParams::default(), data),
        )
        .await
        {
            Ok(Ok(_)) => debug!(status = ?load_test.status, "status updated"),
            Ok(Err(err)) if is_conflict(&err) => {
                warn!(
                    loadtest = %key,
                    "conflict between datastore and cache while updating status, object was removed or modified in the datastore"
                );
            }
            Ok(Err(err)) => error!(error = %err, "failed updating loadtest status"),
            Err(_) => error!(loadtest = %key, "timed out updating loadtest status"),
        }
    }

    // Discover the namespace owned by this load test, creating it on first
    // reconcile. Once status.namespace is set it is never changed.
    async fn check_or_create_namespace(
        &self,
        deadline: Instant,
        load_test: &mut LoadTest,
    ) -> Result<(), Error> {
        let name = load_test.name_any();
        let has_namespace = load_test
            .status
            .as_ref()
            .and_then(|status| status.namespace.as_deref())
            .map(|ns| !ns.is_empty())
            .unwrap_or(false);
        if has_namespace {
            return Ok(());
        }

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let selector = format!("{CONTROLLER_LABEL}={name}");
        let existing = timeout_at(
            deadline,
            namespaces.list(&ListParams::default().labels(&selector)),
        )
        .await??;

        let namespace_name = match existing.items.first() {
            Some(namespace) => namespace.name_any(),
            None => {
                let namespace = new_namespace(
                    load_test,
                    &self.cfg.namespace_labels,
                    &self.cfg.namespace_annotations,
                );
                let created = timeout_at(
                    deadline,
                    namespaces.create(&PostParams::default(), &namespace),
                )
                .await??;
                let created_name = created.name_any();
                info!(
                    loadtest = %name,
                    namespace = %created_name,
                    tags = ?load_test.spec.tags,
                    "created new namespace"
                );
                self.publish_event(
                    deadline,
                    load_test,
                    "Created",
                    "Creating",
                    format!("Created namespace {created_name}"),
                )
                .await;
                created_name
            }
        };

        load_test
            .status
            .get_or_insert_with(Default::default)
            .namespace = Some(namespace_name);
        Ok(())
    }

    // Delete failures are logged and left to a later pass.
    async fn delete_load_test(&self, deadline: Instant, load_test: &LoadTest) {
        let api: Api<LoadTest> = Api::all(self.client.clone());
        let name = load_test.name_any();
        match timeout_at(deadline, api.delete(&name, &DeleteParams::default())).await {
            Ok(Ok(_)) => {
                self.publish_event(
                    deadline,
                    load_test,
                    "Deleted",
                    "Deleting",
                    format!("Deleted loadtest {name} after exceeded lifetime"),
                )
                .await;
            }
            Ok(Err(err)) if is_conflict(&err) => {
                error!(
                    loadtest = %name,
                    "conflict between datastore and cache while deleting loadtest, object was removed or modified in the datastore"
                );
            }
            Ok(Err(err)) => error!(loadtest = %name, error = %err, "failed to delete loadtest"),
            Err(_) => error!(loadtest = %name, "timed out deleting loadtest"),
        }
    }

    // Events are best effort; failures are logged and ignored.
    async fn publish_event(
        &self,
        deadline: Instant,
        load_test: &LoadTest,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            load_test.object_ref(&()),
        );
        let event = PlatformEvent {
            type_: EventType::Normal,
            reason: reason.to_owned(),
            note: Some(note),
            action: action.to_owned(),
            secondary: None,
        };
        match timeout_at(deadline, recorder.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to record event"),
            Err(_) => warn!("timed out recording event"),
        }
    }

    fn spawn_informers(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let owned_config = watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR);
        let load_tests = {
            let controller = self.clone();
            spawn_informer(
                Api::<LoadTest>::all(self.client.clone()),
                watcher::Config::default(),
                self.load_tests.clone(),
                move |event| controller.handle_load_test_event(event),
            )
        };
        let jobs = {
            let controller = self.clone();
            spawn_informer(
                Api::<Job>::all(self.client.clone()),
                owned_config.clone(),
                self.jobs.clone(),
                move |event| controller.handle_owned_object_event(event),
            )
        };
        let pods = {
            let controller = self.clone();
            spawn_informer(
                Api::<Pod>::all(self.client.clone()),
                owned_config,
                self.pods.clone(),
                move |event| controller.handle_owned_object_event(event),
            )
        };
        vec![load_tests, jobs, pods]
    }

    /// Route a LoadTest change to the work queue.
    ///
    /// Deletes are intentionally ignored: reconciling a missing object is a
    /// no-op.
    pub(crate) fn handle_load_test_event(&self, event: RawEvent<LoadTest>) {
        match event {
            RawEvent::Added(load_test) => self.enqueue_load_test(&load_test),
            RawEvent::Updated { new, .. } => self.enqueue_load_test(&new),
            RawEvent::Deleted(_) => {}
        }
    }

    /// Route a change of an owned object (Job, Pod) to the work queue by
    /// resolving its controlling owner reference.
    pub(crate) fn handle_owned_object_event<K: Resource>(&self, event: RawEvent<K>) {
        let object = match event {
            RawEvent::Added(object) => object,
            RawEvent::Updated { old, new } => {
                // Periodic resync events carry no real change.
                if old.meta().resource_version == new.meta().resource_version {
                    return;
                }
                new
            }
            RawEvent::Deleted(tombstone) => {
                if let Tombstone::FinalStateUnknown(object) = &tombstone {
                    info!(
                        object = %object.meta().name.as_deref().unwrap_or_default(),
                        "recovered deleted object from tombstone"
                    );
                }
                tombstone.into_inner()
            }
        };

        let meta = object.meta();
        let Some(owner) = meta
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        else {
            return;
        };
        // Not owned by a LoadTest; nothing to do with it.
        if owner.kind != LoadTest::kind(&()) {
            return;
        }
        debug!(object = %meta.name.as_deref().unwrap_or_default(), "processing object");

        match self.load_tests.get(&owner.name) {
            Some(load_test) => self.enqueue_load_test(&load_test),
            None => debug!(
                object = %meta.name.as_deref().unwrap_or_default(),
                owner = %owner.name,
                "ignoring orphaned object"
            ),
        }
    }

    fn enqueue_load_test(&self, load_test: &LoadTest) {
        self.queue.add(load_test.work_key());
    }
}

struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

/// Report link for a load test, empty when no proxy is configured.
fn build_report_url(proxy_url: &str, name: &str) -> String {
    if proxy_url.is_empty() {
        String::new()
    } else {
        format!("{proxy_url}/load-test/{name}/report")
    }
}

fn new_namespace(
    load_test: &LoadTest,
    extra_labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Namespace {
    let mut labels = extra_labels.clone();
    labels.insert(CONTROLLER_LABEL.to_owned(), load_test.name_any());
    labels.insert("app".to_owned(), CONTROLLER_NAME.to_owned());
    Namespace {
        metadata: ObjectMeta {
            name: Some(load_test.name_any()),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then(|| annotations.clone()),
            owner_references: load_test.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        ..Default::default()
    }
}

// True when the load test finished or errored longer than the threshold ago.
// An errored test without a completion timestamp falls back to its creation
// timestamp.
fn lifetime_exceeded(load_test: &LoadTest, threshold: Duration, now: DateTime<Utc>) -> bool {
    let Some(status) = &load_test.status else {
        return false;
    };

    if let Some(completed) = status.job_status.completion_time {
        if elapsed_exceeds(completed, now, threshold)
            && matches!(
                status.phase,
                LoadTestPhase::Finished | LoadTestPhase::Errored
            )
        {
            return true;
        }
    }

    if status.phase == LoadTestPhase::Errored {
        if let Some(created) = &load_test.meta().creation_timestamp {
            if elapsed_exceeds(created.0, now, threshold) {
                return true;
            }
        }
    }

    false
}

// Strictly greater than; an elapsed time equal to the threshold does not count.
fn elapsed_exceeds(from: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now.signed_duration_since(from)
        .to_std()
        .map(|elapsed| elapsed > threshold)
        .unwrap_or(false)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}
