//! Controller configuration.
//!
//! The struct is populated by the CLI from flags and environment variables;
//! the controller itself only ever reads it.
use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::api::core::v1::Toleration;

/// Configuration consumed by the controller.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Per-reconcile deadline.
    pub sync_handler_timeout: Duration,
    /// Age after which finished or errored load tests are deleted.
    /// Zero disables garbage collection.
    pub clean_up_threshold: Duration,
    /// Base URL of the kangal proxy, used to build report links. Empty
    /// disables report links.
    pub kangal_proxy_url: String,
    /// Labels attached to every load test namespace.
    pub namespace_labels: BTreeMap<String, String>,
    /// Annotations attached to every load test namespace.
    pub namespace_annotations: BTreeMap<String, String>,
    /// Annotations attached to load test pods.
    pub pod_annotations: BTreeMap<String, String>,
    /// Node selector applied to load test pods.
    pub node_selectors: BTreeMap<String, String>,
    /// Tolerations applied to load test pods.
    pub tolerations: Vec<Toleration>,
    /// Address of the Kubernetes API server; overrides the kubeconfig.
    pub master_url: String,
    /// Absolute path to a kubeconfig file, for running out of cluster.
    pub kube_config: String,
    /// Request timeout for the Kubernetes client.
    pub kube_client_timeout: Duration,
}

/// Error produced while parsing configuration entries.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// A `key:value` entry had no separator.
    #[error("entry {0:?} is invalid, expected key:value")]
    InvalidKeyValue(String),
    /// A toleration entry did not have four segments.
    #[error("toleration {0:?} is invalid, expected key:operator:value:effect")]
    InvalidToleration(String),
}

/// Parse `key:value` entries into a map.
///
/// Double quotes are stripped and the entry is split once from the left, so
/// values may themselves contain colons:
/// `iam.amazonaws.com/role: "arn:aws:iam::id:role/some-role"` becomes
/// `iam.amazonaws.com/role` → `arn:aws:iam::id:role/some-role`.
pub fn parse_key_value_pairs<S: AsRef<str>>(
    entries: &[S],
) -> Result<BTreeMap<String, String>, ParseError> {
    let mut map = BTreeMap::new();
    for entry in entries {
        let entry = entry.as_ref().replace('"', "");
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidKeyValue(entry.clone()))?;
        map.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(map)
}

/// Parse `key:operator:value:effect` entries into tolerations.
/// Empty segments leave the corresponding field unset.
pub fn parse_tolerations<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Toleration>, ParseError> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.as_ref();
            let parts: Vec<&str> = entry.split(':').collect();
            let [key, operator, value, effect] = parts.as_slice() else {
                return Err(ParseError::InvalidToleration(entry.to_owned()));
            };
            let set = |s: &&str| {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_owned())
            };
            Ok(Toleration {
                key: set(key),
                operator: set(operator),
                value: set(value),
                effect: set(effect),
                toleration_seconds: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_split_once_and_strip_quotes() {
        let map = parse_key_value_pairs(&[
            r#"iam.amazonaws.com/role: "arn:aws:iam::id:role/some-role""#,
            "team:platform",
        ])
        .unwrap();
        assert_eq!(
            map.get("iam.amazonaws.com/role").map(String::as_str),
            Some("arn:aws:iam::id:role/some-role")
        );
        assert_eq!(map.get("team").map(String::as_str), Some("platform"));
    }

    #[test]
    fn key_value_pairs_reject_missing_separator() {
        let err = parse_key_value_pairs(&["not-a-pair"]).unwrap_err();
        assert_eq!(err, ParseError::InvalidKeyValue("not-a-pair".to_owned()));
    }

    #[test]
    fn tolerations_parse_all_segments() {
        let tolerations =
            parse_tolerations(&["dedicated:Equal:loadtest:NoSchedule", ":Exists::NoExecute"])
                .unwrap();
        assert_eq!(
            tolerations[0],
            Toleration {
                key: Some("dedicated".to_owned()),
                operator: Some("Equal".to_owned()),
                value: Some("loadtest".to_owned()),
                effect: Some("NoSchedule".to_owned()),
                toleration_seconds: None,
            }
        );
        assert_eq!(tolerations[1].key, None);
        assert_eq!(tolerations[1].operator, Some("Exists".to_owned()));
        assert_eq!(tolerations[1].value, None);
    }

    #[test]
    fn tolerations_reject_wrong_arity() {
        assert!(parse_tolerations(&["only:three:parts"]).is_err());
    }
}
