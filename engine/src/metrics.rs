//! Typed views over the cluster metrics API.
//!
//! The metrics endpoint is a sub-resource keyed by namespace/pod or
//! cluster/node. The engine does not depend on generated types for it;
//! requests go over the raw API paths and deserialize into the small shapes
//! below, mirroring how the rest of the system treats metrics as a capability
//! interface.
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::{client::Client, core::ObjectMeta};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::Error;

/// API group serving usage metrics.
pub const METRICS_API_GROUP: &str = "metrics.k8s.io";
/// Version of the metrics API group the engine speaks.
pub const METRICS_API_VERSION: &str = "v1beta1";

/// A point-in-time CPU/memory reading for a pod or node.
#[derive(Clone, Debug, PartialEq)]
pub struct UsageSample {
    /// CPU usage, e.g. `150m`.
    pub cpu: Quantity,
    /// Memory usage, e.g. `200Mi`.
    pub memory: Quantity,
    /// When the sample was scraped, if the API reported it.
    pub timestamp: Option<DateTime<Utc>>,
}

/// CPU/memory pair as returned by the metrics API.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceUsage {
    /// CPU quantity.
    pub cpu: Quantity,
    /// Memory quantity.
    pub memory: Quantity,
}

/// Usage of a single container within a pod.
#[derive(Clone, Debug, Deserialize)]
pub struct ContainerMetrics {
    /// Container name.
    pub name: String,
    /// Container usage.
    pub usage: ResourceUsage,
}

/// Usage of all containers of one pod.
#[derive(Clone, Debug, Deserialize)]
pub struct PodMetrics {
    /// Pod identity.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Scrape time.
    pub timestamp: Option<String>,
    /// Per-container usage.
    pub containers: Vec<ContainerMetrics>,
}

/// List of pod metrics for one namespace.
#[derive(Clone, Debug, Deserialize)]
pub struct PodMetricsList {
    /// Items of the list.
    pub items: Vec<PodMetrics>,
}

/// Usage of one node.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeMetrics {
    /// Node identity.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Scrape time.
    pub timestamp: Option<String>,
    /// Node usage.
    pub usage: ResourceUsage,
}

/// List of node metrics for the cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeMetricsList {
    /// Items of the list.
    pub items: Vec<NodeMetrics>,
}

impl PodMetrics {
    /// Sample of the pod's first container, or `None` for a pod without
    /// containers.
    pub fn sample(&self) -> Option<UsageSample> {
        self.containers.first().map(|container| UsageSample {
            cpu: container.usage.cpu.clone(),
            memory: container.usage.memory.clone(),
            timestamp: parse_timestamp(self.timestamp.as_deref()),
        })
    }
}

impl NodeMetrics {
    /// Sample of the node.
    pub fn sample(&self) -> UsageSample {
        UsageSample {
            cpu: self.usage.cpu.clone(),
            memory: self.usage.memory.clone(),
            timestamp: parse_timestamp(self.timestamp.as_deref()),
        }
    }
}

fn parse_timestamp(timestamp: Option<&str>) -> Option<DateTime<Utc>> {
    timestamp
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn pods_usage_path(namespace: &str) -> String {
    format!("/apis/{METRICS_API_GROUP}/{METRICS_API_VERSION}/namespaces/{namespace}/pods")
}

pub(crate) fn pod_usage_path(namespace: &str, pod: &str) -> String {
    format!("/apis/{METRICS_API_GROUP}/{METRICS_API_VERSION}/namespaces/{namespace}/pods/{pod}")
}

pub(crate) fn nodes_usage_path() -> String {
    format!("/apis/{METRICS_API_GROUP}/{METRICS_API_VERSION}/nodes")
}

pub(crate) fn node_usage_path(node: &str) -> String {
    format!("/apis/{METRICS_API_GROUP}/{METRICS_API_VERSION}/nodes/{node}")
}

/// Issue a GET against a raw metrics API path.
pub(crate) async fn fetch<T: DeserializeOwned>(client: &Client, path: &str) -> Result<T, Error> {
    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(kube::Error::HttpError)?;
    Ok(client.request::<T>(request).await?)
}
