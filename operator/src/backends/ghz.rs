//! Reference backend running a single ghz job per load test.
use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::{JobSpec, JobStatus},
    core::v1::{
        ConfigMapVolumeSource, Container, EnvVar, PodSpec, PodTemplateSpec, Toleration, Volume,
        VolumeMount,
    },
};
use kube::{api::Api, client::Client, core::ObjectMeta, Resource, ResourceExt};
use tracing::warn;

use crate::{
    backends::{build_resource_requirements, Backend, BackendError, BackendResources},
    config::Config,
    labels::managed_labels_extend,
    loadtest::{ImageDetails, LoadTest, LoadTestJobStatus, LoadTestPhase, LoadTestStatus},
    utils::{apply_config_map, apply_job},
};

/// Type string served by this backend.
pub const BACKEND_TYPE: &str = "ghz";

const LOAD_TEST_JOB_NAME: &str = "loadtest-job";
const TEST_FILE_CONFIG_MAP_NAME: &str = "loadtest-testfile";
const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_FILE_PATH: &str = "/data/config.json";

/// Backend that runs ghz against the declared test file.
pub struct GhzBackend {
    client: Client,
    image: ImageDetails,
    pod_annotations: BTreeMap<String, String>,
    node_selectors: BTreeMap<String, String>,
    tolerations: Vec<Toleration>,
    resources: BackendResources,
}

impl GhzBackend {
    /// New backend with the default image and placement from config.
    pub fn new(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            image: ImageDetails::new("hellofresh/kangal-ghz", "latest"),
            pod_annotations: cfg.pod_annotations.clone(),
            node_selectors: cfg.node_selectors.clone(),
            tolerations: cfg.tolerations.clone(),
            resources: BackendResources::default(),
        }
    }

    /// Override the default container image.
    pub fn with_image(mut self, image: ImageDetails) -> Self {
        self.image = image;
        self
    }

    /// Set container resource requests and limits.
    pub fn with_resources(mut self, resources: BackendResources) -> Self {
        self.resources = resources;
        self
    }

    fn test_file_data(load_test: &LoadTest) -> BTreeMap<String, String> {
        BTreeMap::from_iter(vec![(
            CONFIG_FILE_NAME.to_owned(),
            load_test.spec.test_file.clone(),
        )])
    }

    fn job_spec(&self, load_test: &LoadTest, report_url: &str) -> JobSpec {
        let image_ref = match &load_test.spec.master_config {
            Some(master) if !master.is_incomplete() => master.reference(),
            _ => {
                let image_ref = self.image.reference();
                warn!(
                    loadtest = %load_test.name_any(),
                    image_ref = %image_ref,
                    "loadtest masterConfig is empty, using default image"
                );
                image_ref
            }
        };

        let mut env = Vec::new();
        if !report_url.is_empty() {
            env.push(EnvVar {
                name: "REPORT_PRESIGNED_URL".to_owned(),
                value: Some(report_url.to_owned()),
                ..Default::default()
            });
        }

        JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    // The pod watch is filtered on the managed-by label and
                    // pods only inherit template labels, so it goes here too.
                    labels: managed_labels_extend(Some(BTreeMap::from_iter(vec![(
                        "name".to_owned(),
                        LOAD_TEST_JOB_NAME.to_owned(),
                    )]))),
                    annotations: (!self.pod_annotations.is_empty())
                        .then(|| self.pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    node_selector: (!self.node_selectors.is_empty())
                        .then(|| self.node_selectors.clone()),
                    tolerations: (!self.tolerations.is_empty()).then(|| self.tolerations.clone()),
                    volumes: Some(vec![Volume {
                        name: "testfile".to_owned(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(TEST_FILE_CONFIG_MAP_NAME.to_owned()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "ghz".to_owned(),
                        image: Some(image_ref),
                        env: (!env.is_empty()).then_some(env),
                        resources: Some(build_resource_requirements(&self.resources)),
                        args: Some(vec![
                            format!("--config={CONFIG_FILE_PATH}"),
                            "--output=/results".to_owned(),
                            "--format=html".to_owned(),
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "testfile".to_owned(),
                            mount_path: CONFIG_FILE_PATH.to_owned(),
                            sub_path: Some(CONFIG_FILE_NAME.to_owned()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl Backend for GhzBackend {
    fn backend_type(&self) -> &'static str {
        BACKEND_TYPE
    }

    async fn sync(&self, load_test: &LoadTest, report_url: &str) -> Result<(), BackendError> {
        let ns = load_test
            .status
            .as_ref()
            .and_then(|status| status.namespace.clone())
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| BackendError::Other(anyhow!("load test namespace is not set")))?;
        let orefs = load_test
            .controller_owner_ref(&())
            .map(|oref| vec![oref])
            .unwrap_or_default();

        apply_config_map(
            self.client.clone(),
            &ns,
            orefs.clone(),
            TEST_FILE_CONFIG_MAP_NAME,
            Self::test_file_data(load_test),
        )
        .await?;

        apply_job(
            self.client.clone(),
            &ns,
            orefs,
            LOAD_TEST_JOB_NAME,
            Some(BTreeMap::from_iter(vec![(
                "name".to_owned(),
                LOAD_TEST_JOB_NAME.to_owned(),
            )])),
            self.job_spec(load_test, report_url),
        )
        .await?;
        Ok(())
    }

    async fn sync_status(
        &self,
        _load_test: &LoadTest,
        status: &mut LoadTestStatus,
    ) -> Result<(), BackendError> {
        let Some(ns) = status.namespace.clone().filter(|ns| !ns.is_empty()) else {
            return Ok(());
        };
        let jobs: Api<k8s_openapi::api::batch::v1::Job> = Api::namespaced(self.client.clone(), &ns);
        let Some(job) = jobs.get_opt(LOAD_TEST_JOB_NAME).await? else {
            return Ok(());
        };

        let job_status = job.status.unwrap_or_default();
        status.phase = phase_from_job(&job_status);
        status.job_status = LoadTestJobStatus {
            active: job_status.active,
            succeeded: job_status.succeeded,
            failed: job_status.failed,
            start_time: job_status.start_time.map(|t| t.0),
            completion_time: job_status.completion_time.map(|t| t.0),
        };
        Ok(())
    }
}

// Reads the job counters and determines what the loadtest phase should be.
fn phase_from_job(status: &JobStatus) -> LoadTestPhase {
    if status.failed.unwrap_or(0) > 0 {
        return LoadTestPhase::Errored;
    }
    if status.active.unwrap_or(0) > 0 {
        return LoadTestPhase::Running;
    }
    if status.succeeded.unwrap_or(0) == 0 && status.failed.unwrap_or(0) == 0 {
        return LoadTestPhase::Starting;
    }
    LoadTestPhase::Finished
}
