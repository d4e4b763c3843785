//! Pluggable backends that materialize LoadTests into cluster workloads.
pub mod ghz;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
};

use crate::loadtest::{LoadTest, LoadTestStatus};

/// Errors produced by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Error talking to the Kubernetes API; retryable.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// Failure that no retry will resolve; the work key is dropped.
    #[error("permanent backend failure: {0}")]
    Permanent(#[source] anyhow::Error),
    /// Any other failure; retryable.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A load generator technology.
///
/// Backends are stateless with respect to LoadTests; configured defaults
/// (image, annotations, resources) are fixed at construction.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Type string this backend serves, matched against `spec.type`.
    fn backend_type(&self) -> &'static str;

    /// Idempotently create or update all workloads for the load test.
    ///
    /// Must tolerate partial prior state, e.g. a namespace and config map
    /// that exist without a job. The test namespace is read from
    /// `load_test.status`.
    async fn sync(&self, load_test: &LoadTest, report_url: &str) -> Result<(), BackendError>;

    /// Observe the owned workloads and fold their state into `status`.
    ///
    /// The test namespace is read from the `status` argument, which starts
    /// as a copy of the load test's current status.
    async fn sync_status(
        &self,
        load_test: &LoadTest,
        status: &mut LoadTestStatus,
    ) -> Result<(), BackendError>;
}

/// Unknown `spec.type` value.
#[derive(Debug, thiserror::Error)]
#[error("no backend registered for type {0:?}")]
pub struct UnknownBackend(pub String);

/// Maps LoadTest type strings to backends.
///
/// Populated at startup and immutable afterwards.
#[derive(Default, Clone)]
pub struct Registry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its type string.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends
            .insert(backend.backend_type().to_owned(), backend);
    }

    /// Look up the backend for a type string.
    pub fn get(&self, backend_type: &str) -> Result<Arc<dyn Backend>, UnknownBackend> {
        self.backends
            .get(backend_type)
            .cloned()
            .ok_or_else(|| UnknownBackend(backend_type.to_owned()))
    }
}

/// Resource requests and limits applied to backend containers.
#[derive(Debug, Clone, Default)]
pub struct BackendResources {
    /// CPU limit, e.g. `500m`.
    pub cpu_limits: Option<String>,
    /// Memory limit, e.g. `512Mi`.
    pub memory_limits: Option<String>,
    /// CPU request.
    pub cpu_requests: Option<String>,
    /// Memory request.
    pub memory_requests: Option<String>,
}

/// Build container resource requirements from configured values.
pub fn build_resource_requirements(resources: &BackendResources) -> ResourceRequirements {
    let mut limits = std::collections::BTreeMap::new();
    let mut requests = std::collections::BTreeMap::new();
    if let Some(cpu) = &resources.cpu_limits {
        limits.insert("cpu".to_owned(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &resources.memory_limits {
        limits.insert("memory".to_owned(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &resources.cpu_requests {
        requests.insert("cpu".to_owned(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &resources.memory_requests {
        requests.insert("memory".to_owned(), Quantity(memory.clone()));
    }
    ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use mockall::mock;

    mock! {
        pub TestBackend {}
        #[async_trait]
        impl Backend for TestBackend {
            fn backend_type(&self) -> &'static str;
            async fn sync(&self, load_test: &LoadTest, report_url: &str) -> Result<(), BackendError>;
            async fn sync_status(
                &self,
                load_test: &LoadTest,
                status: &mut LoadTestStatus,
            ) -> Result<(), BackendError>;
        }
    }

    #[test]
    fn registry_resolves_registered_types() {
        let mut backend = MockTestBackend::new();
        backend.expect_backend_type().return_const("ghz");
        let mut registry = Registry::new();
        registry.register(Arc::new(backend));

        assert!(registry.get("ghz").is_ok());
        match registry.get("jmeter") {
            Ok(_) => panic!("expected an error for unregistered backend type"),
            Err(err) => {
                assert_eq!(err.to_string(), r#"no backend registered for type "jmeter""#);
            }
        }
    }

    #[test]
    fn resource_requirements_skip_unset_values() {
        let requirements = build_resource_requirements(&BackendResources {
            cpu_limits: Some("500m".to_owned()),
            ..Default::default()
        });
        let limits = requirements.limits.unwrap();
        assert_eq!(limits.get("cpu"), Some(&Quantity("500m".to_owned())));
        assert!(!limits.contains_key("memory"));
        assert!(requirements.requests.is_none());
    }
}
