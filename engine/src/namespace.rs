//! Ensures namespaces exist and are active before resources land in them.
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::{api::PostParams, core::ObjectMeta, Api, ResourceExt};
use tracing::{info, warn};

use crate::{
    error::Error,
    labels::managed_labels,
    utils::{wait_for, Context},
};

/// Phase reported by a namespace that is ready for resources.
const NAMESPACE_ACTIVE_PHASE: &str = "Active";

/// Creates missing namespaces and waits for them to become active.
pub struct NamespaceReconciler<R, Rng> {
    cx: Arc<Context<R, Rng>>,
}

impl<R, Rng> NamespaceReconciler<R, Rng> {
    /// Create a reconciler over the shared context.
    pub fn new(cx: Arc<Context<R, Rng>>) -> Self {
        Self { cx }
    }

    /// Ensure `namespace` exists and is active, creating it if absent.
    ///
    /// Idempotent: an existing namespace is returned as-is. Read failures
    /// while waiting for a fresh namespace are logged and polling continues;
    /// the wait is bounded by the context's poll deadline.
    pub async fn ensure(&self, namespace: &str) -> Result<Namespace, Error> {
        let api: Api<Namespace> = Api::all(self.cx.k_client.clone());
        if let Some(ns) = api.get_opt(namespace).await? {
            return Ok(ns);
        }

        info!(namespace, "namespace does not exist, creating it");
        let data = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_owned()),
                labels: managed_labels(),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        api.create(&PostParams::default(), &data)
            .await
            .map_err(|source| Error::ResourceCreate {
                kind: "namespace",
                name: namespace.to_owned(),
                source,
            })?;

        info!(namespace, "waiting for namespace to become active");
        let name = namespace.to_owned();
        let active = wait_for(
            &self.cx.polling,
            format!("namespace '{namespace}' to become active"),
            || {
                let api = api.clone();
                let name = name.clone();
                async move {
                    match api.get_opt(&name).await {
                        Ok(Some(ns)) if is_active(&ns) => Ok(Some(ns)),
                        Ok(_) => Ok(None),
                        Err(err) => {
                            warn!(%err, namespace = %name, "namespace read failed, retrying");
                            Ok(None)
                        }
                    }
                }
            },
        )
        .await?;
        info!(namespace = %active.name_any(), "namespace is active");
        Ok(active)
    }
}

fn is_active(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some(NAMESPACE_ACTIVE_PHASE)
}
