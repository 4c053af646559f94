//! Read-only queries for nodes, pods, services and their live usage.
use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::{api::ListParams, Api, ResourceExt};
use tracing::debug;

use crate::{
    error::Error,
    metrics::{
        self, node_usage_path, nodes_usage_path, pod_usage_path, pods_usage_path, NodeMetrics,
        NodeMetricsList, PodMetrics, PodMetricsList, UsageSample,
    },
    utils::{wait_for, Context},
};

/// Substring marking a node as part of the control plane.
///
/// Such nodes are never placement candidates.
const CONTROL_PLANE_MARKER: &str = "master";

/// Read-only view of one cluster, scoped to a default namespace.
pub struct Monitor<R, Rng> {
    cx: Arc<Context<R, Rng>>,
    namespace: String,
}

impl<R, Rng> Monitor<R, Rng> {
    /// Create a monitor over the shared context.
    pub fn new(cx: Arc<Context<R, Rng>>, namespace: impl Into<String>) -> Self {
        Self {
            cx,
            namespace: namespace.into(),
        }
    }

    fn namespace_or<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(&self.namespace)
    }

    /// List schedulable nodes, sorted by name.
    pub async fn nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.cx.k_client.clone());
        let mut nodes: Vec<Node> = api
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|node| !node.name_any().contains(CONTROL_PLANE_MARKER))
            .collect();
        nodes.sort_by_key(|node| node.name_any());
        Ok(nodes)
    }

    /// Get a specific pod, or `None` if it does not exist.
    pub async fn pod(&self, name: &str, namespace: Option<&str>) -> Result<Option<Pod>, Error> {
        let ns = self.namespace_or(namespace);
        let api: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    /// List the pods of a namespace.
    pub async fn pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>, Error> {
        let ns = self.namespace_or(namespace);
        let api: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Get a specific service, or `None` if it does not exist.
    pub async fn service(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Service>, Error> {
        let ns = self.namespace_or(namespace);
        let api: Api<Service> = Api::namespaced(self.cx.k_client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    /// List the services of a namespace.
    pub async fn services(&self, namespace: Option<&str>) -> Result<Vec<Service>, Error> {
        let ns = self.namespace_or(namespace);
        let api: Api<Service> = Api::namespaced(self.cx.k_client.clone(), ns);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Usage of every pod in a namespace, keyed by pod name.
    ///
    /// Metrics pipelines have warm-up latency, so an empty result set is
    /// retried at the poll cadence until at least one entry is present. The
    /// wait is bounded by the context's poll deadline and cancellable by
    /// dropping the future.
    pub async fn pods_usage(
        &self,
        namespace: Option<&str>,
    ) -> Result<BTreeMap<String, UsageSample>, Error> {
        let ns = self.namespace_or(namespace);
        let client = self.cx.k_client.clone();
        let path = pods_usage_path(ns);
        wait_for(
            &self.cx.polling,
            format!("pod metrics in namespace '{ns}'"),
            || {
                let client = client.clone();
                let path = path.clone();
                async move {
                    let list: PodMetricsList = metrics::fetch(&client, &path).await?;
                    if list.items.is_empty() {
                        debug!("pod metrics not yet scraped");
                        return Ok(None);
                    }
                    let mut usage = BTreeMap::new();
                    for item in list.items {
                        if let Some(sample) = item.sample() {
                            usage.insert(item.metadata.name.clone().unwrap_or_default(), sample);
                        }
                    }
                    Ok(Some(usage))
                }
            },
        )
        .await
    }

    /// Usage of one pod, or `None` if no metrics exist for it yet.
    pub async fn pod_usage(
        &self,
        pod: &str,
        namespace: Option<&str>,
    ) -> Result<Option<UsageSample>, Error> {
        let ns = self.namespace_or(namespace);
        match metrics::fetch::<PodMetrics>(&self.cx.k_client, &pod_usage_path(ns, pod)).await {
            Ok(metrics) => Ok(metrics.sample()),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Usage of every node, keyed by node name. Single shot, no retry.
    pub async fn nodes_usage(&self) -> Result<BTreeMap<String, UsageSample>, Error> {
        let list: NodeMetricsList =
            metrics::fetch(&self.cx.k_client, &nodes_usage_path()).await?;
        Ok(list
            .items
            .into_iter()
            .map(|node| {
                let sample = node.sample();
                (node.metadata.name.unwrap_or_default(), sample)
            })
            .collect())
    }

    /// Usage of one node, or `None` if no metrics exist for it.
    pub async fn node_usage(&self, node: &str) -> Result<Option<UsageSample>, Error> {
        match metrics::fetch::<NodeMetrics>(&self.cx.k_client, &node_usage_path(node)).await {
            Ok(metrics) => Ok(Some(metrics.sample())),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(
        err,
        Error::Kube {
            source: kube::Error::Api(response)
        } if response.reason == "NotFound"
    )
}
