//! Utils is shared functions and constants for the controller
#[cfg(test)]
pub mod test;

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec, JobStatus},
        core::v1::ConfigMap,
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{Patch, PatchParams},
    client::Client,
    core::ObjectMeta,
    Api,
};

use crate::labels::{managed_labels, managed_labels_extend};
use crate::CONTROLLER_NAME;

use anyhow::Result;

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Apply a config map in a namespace.
pub async fn apply_config_map(
    client: Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<(), kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let config_maps: Api<ConfigMap> = Api::namespaced(client, ns);
    // Server-side apply config map
    let map_data = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Default::default()
    };
    config_maps
        .patch(name, &serverside, &Patch::Apply(map_data))
        .await?;
    Ok(())
}

/// Apply a job in a namespace with extra labels.
pub async fn apply_job(
    client: Client,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
    spec: JobSpec,
) -> Result<Option<JobStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let jobs: Api<Job> = Api::namespaced(client, ns);

    // Server-side apply job
    let job: Job = Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let job = jobs.patch(name, &serverside, &Patch::Apply(job)).await?;
    Ok(job.status)
}

/// Build the client configuration for reaching the Kubernetes API server.
///
/// An empty kubeconfig path falls back to the in-cluster/inferred
/// configuration; a non-empty master URL overrides whatever the
/// configuration says.
pub async fn build_client_config(
    master_url: &str,
    kube_config: &str,
    timeout: Duration,
) -> Result<kube::Config> {
    let mut config = if kube_config.is_empty() {
        kube::Config::infer().await?
    } else {
        let kubeconfig = kube::config::Kubeconfig::read_from(kube_config)?;
        kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await?
    };
    if !master_url.is_empty() {
        config.cluster_url = master_url.parse()?;
    }
    config.connect_timeout = Some(timeout);
    Ok(config)
}
