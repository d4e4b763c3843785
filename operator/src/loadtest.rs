//! LoadTest is the k8s custom resource that declares a single load test.
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD describing a load test to run.
///
/// LoadTests are cluster scoped; each one owns a namespace in which its
/// workloads are created.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kangal.hellofresh.com",
    version = "v1",
    kind = "LoadTest",
    plural = "loadtests",
    status = "LoadTestStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    /// Backend that materializes this test, e.g. `ghz`.
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Test definition handed to the backend, format is backend defined.
    pub test_file: String,
    /// Container image override for the master job.
    pub master_config: Option<ImageDetails>,
    /// Free-form labels, logged when the test namespace is created.
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
}

/// Container image reference.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    /// Image repository.
    pub image: String,
    /// Image tag.
    pub tag: String,
}

impl ImageDetails {
    /// New image details from repository and tag.
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// Full `image:tag` reference.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// True when either half of the reference is missing.
    pub fn is_incomplete(&self) -> bool {
        self.image.is_empty() || self.tag.is_empty()
    }
}

/// Coarse state of a load test.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum LoadTestPhase {
    /// Resources are being created.
    #[default]
    Creating,
    /// Workloads exist but have not started running.
    Starting,
    /// The load test is running.
    Running,
    /// The load test ran to completion.
    Finished,
    /// The load test failed.
    Errored,
}

impl std::fmt::Display for LoadTestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadTestPhase::Creating => "Creating",
            LoadTestPhase::Starting => "Starting",
            LoadTestPhase::Running => "Running",
            LoadTestPhase::Finished => "Finished",
            LoadTestPhase::Errored => "Errored",
        };
        f.write_str(s)
    }
}

/// Current status of a load test.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestStatus {
    /// Phase of the load test.
    pub phase: LoadTestPhase,
    /// Namespace owned by this load test. Set on first successful reconcile,
    /// stable afterwards.
    pub namespace: Option<String>,
    /// Observed status of the backing job.
    #[serde(default)]
    pub job_status: LoadTestJobStatus,
}

/// The fields of the backing job's status consumed by the controller.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestJobStatus {
    /// Number of actively running pods.
    pub active: Option<i32>,
    /// Number of pods which reached phase Succeeded.
    pub succeeded: Option<i32>,
    /// Number of pods which reached phase Failed.
    pub failed: Option<i32>,
    /// Time the job was acknowledged by the job controller.
    pub start_time: Option<DateTime<Utc>>,
    /// Time the job completed.
    pub completion_time: Option<DateTime<Utc>>,
}

impl LoadTest {
    /// Status of the load test, defaulted when not yet set.
    pub fn status_or_default(&self) -> LoadTestStatus {
        self.status.clone().unwrap_or_default()
    }

    /// The work queue key for this load test.
    ///
    /// LoadTests are cluster scoped so the key is the bare name; the helper
    /// exists so namespaced kinds and LoadTests share one key scheme.
    pub fn work_key(&self) -> String {
        work_key(self.namespace().as_deref(), &self.name_any())
    }
}

/// Build a `"<ns>/<name>"` work key, or `"<name>"` for cluster-scoped objects.
pub fn work_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_owned(),
    }
}

/// Split a work key into its name part, ignoring any namespace prefix.
pub fn split_work_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    impl LoadTest {
        /// A minimal LoadTest for tests.
        pub fn test(name: &str) -> Self {
            let mut lt = LoadTest::new(
                name,
                LoadTestSpec {
                    backend_type: "ghz".to_owned(),
                    test_file: "{}".to_owned(),
                    ..Default::default()
                },
            );
            lt.meta_mut().uid = Some("1234-5678".to_owned());
            lt
        }

        pub fn with_spec(mut self, spec: LoadTestSpec) -> Self {
            self.spec = spec;
            self
        }

        pub fn with_status(mut self, status: LoadTestStatus) -> Self {
            self.status = Some(status);
            self
        }
    }

    #[test]
    fn work_key_cluster_scoped() {
        assert_eq!(work_key(None, "t1"), "t1");
        assert_eq!(work_key(Some(""), "t1"), "t1");
    }

    #[test]
    fn work_key_namespaced() {
        assert_eq!(work_key(Some("ns"), "t1"), "ns/t1");
    }

    #[test]
    fn split_work_key_ignores_namespace() {
        assert_eq!(split_work_key("ns/t1"), "t1");
        assert_eq!(split_work_key("t1"), "t1");
    }

    #[test]
    fn phase_serializes_pascal_case() {
        let json = serde_json::to_string(&LoadTestPhase::Errored).unwrap();
        assert_eq!(json, r#""Errored""#);
    }

    #[test]
    fn spec_round_trips_type_field() {
        let lt = LoadTest::test("t1");
        let value = serde_json::to_value(&lt.spec).unwrap();
        assert_eq!(value["type"], "ghz");
        assert_eq!(value["testFile"], "{}");
    }
}
