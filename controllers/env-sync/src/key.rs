//! Reconciliation keys.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use std::fmt;

/// Identifies one ConfigMap to reconcile.
///
/// Carries no payload: the reconciler always re-reads the live object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    /// Namespace of the ConfigMap
    pub namespace: String,
    /// Name of the ConfigMap
    pub name: String,
}

impl ReconcileKey {
    /// Key for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a ConfigMap as delivered by the watch.
    ///
    /// Objects from a namespaced watch always carry a namespace; `default`
    /// covers hand-built objects in tests.
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        Self::new(
            cm.namespace().unwrap_or_else(|| "default".to_string()),
            cm.name_any(),
        )
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
