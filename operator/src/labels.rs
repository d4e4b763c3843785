use std::collections::BTreeMap;

/// Label selector matching every resource managed by this controller.
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=kangal";

/// Label carried by a load test's namespace; its value is the uniqueness key
/// used to rediscover the namespace on crash recovery.
pub const CONTROLLER_LABEL: &str = "controller";

/// Labels that indicate the resource is managed by the kangal controller.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        "kangal".to_owned(),
    )]))
}

/// Managed labels extended with extra labels.
pub fn managed_labels_extend(
    extra: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut labels = managed_labels();
    if let Some(extra) = extra {
        if let Some(labels) = labels.as_mut() {
            labels.extend(extra);
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_keeps_managed_by() {
        let labels = managed_labels_extend(Some(BTreeMap::from_iter(vec![(
            "name".to_owned(),
            "loadtest-job".to_owned(),
        )])))
        .unwrap();
        assert_eq!(labels.get("managed-by").map(String::as_str), Some("kangal"));
        assert_eq!(labels.get("name").map(String::as_str), Some("loadtest-job"));
    }
}
