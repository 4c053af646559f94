use std::collections::BTreeMap;

use crate::ENGINE_NAME;

/// Create labels that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![("app".to_owned(), app.to_owned())]))
}

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=parkour";

/// Labels that indicate the resource is managed by the engine.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        ENGINE_NAME.to_owned(),
    )]))
}

/// Extend a label set with the managed-by label.
pub fn managed_labels_extend(
    labels: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut all = labels.unwrap_or_default();
    all.extend(managed_labels().unwrap_or_default());
    Some(all)
}
