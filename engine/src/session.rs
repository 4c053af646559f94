//! Composes the engine against one cluster and bootstraps the utilization
//! server.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::ObjectMeta,
    Client, Config,
};
use rand::{rngs::StdRng, RngCore};
use tracing::info;

use crate::{
    actuator::Actuator,
    error::Error,
    labels::{managed_labels_extend, selector_labels},
    monitor::Monitor,
    routing::{HttpRoutingClient, RoutingClient},
    stage::FileStager,
    utils::{Context, PollConfig},
};

/// Well-known name of the utilization server pod and service.
pub const UTILIZATION_SERVER_APP: &str = "utilization-server";
/// Node port on which the utilization server is reachable from outside.
pub const UTILIZATION_NODE_PORT: i32 = 30000;
/// Where the workload payload lands inside the utilization server.
pub const WORKLOAD_DESTINATION: &str = "/";
/// Archive entry name the utilization server expects for its payload.
pub const WORKLOAD_ARCHIVE_NAME: &str = "workloads.pickle";

/// Settings for one cluster session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Explicit kubeconfig path, or `None` to infer from the environment.
    pub kubeconfig: Option<PathBuf>,
    /// Namespace the session works in.
    pub namespace: String,
    /// Local path of the workload payload staged into the utilization server.
    pub workloads_path: PathBuf,
    /// Container image of the utilization server.
    pub utilization_server_image: String,
    /// Node port of the utilization server on the control node.
    pub control_port: u16,
    /// Cadence and bound for the session's wait loops.
    pub polling: PollConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: "vpa".to_owned(),
            workloads_path: PathBuf::from("./data/workloads.pickle"),
            utilization_server_image: "r0ot/utilization-server".to_owned(),
            control_port: UTILIZATION_NODE_PORT as u16,
            polling: PollConfig::default(),
        }
    }
}

/// One established session against a cluster.
///
/// Dropping the session leaves the cluster untouched; call
/// [`ClusterSession::shutdown`] on every exit path that should tear the
/// namespace down.
pub struct ClusterSession<R = HttpRoutingClient, Rng = StdRng> {
    cx: Arc<Context<R, Rng>>,
    /// Read-only cluster queries.
    pub monitor: Monitor<R, Rng>,
    /// Mutating cluster operations.
    pub action: Actuator<R, Rng>,
    /// File staging into running pods.
    pub stager: FileStager<R, Rng>,
}

impl ClusterSession {
    /// Resolve the cluster config, bootstrap the utilization server and
    /// return ready `monitor`/`action` handles.
    pub async fn connect(config: SessionConfig) -> Result<Self, Error> {
        let client = client_for(config.kubeconfig.as_deref()).await?;
        let routing = HttpRoutingClient::new()
            .map_err(|err| Error::Configuration(format!("failed to build http client: {err}")))?;
        let cx = Context::new(client, routing)
            .map_err(|err| Error::Configuration(err.to_string()))?
            .with_polling(config.polling.clone());
        Self::bootstrap(Arc::new(cx), config).await
    }
}

impl<R, Rng> ClusterSession<R, Rng>
where
    R: RoutingClient,
    Rng: RngCore,
{
    /// Bootstrap a session over an existing context.
    ///
    /// Picks the first schedulable node as the control node, cleans the
    /// namespace, starts the utilization server pod and NodePort service on
    /// it, and stages the workload payload inside.
    pub async fn bootstrap(
        cx: Arc<Context<R, Rng>>,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let monitor = Monitor::new(cx.clone(), &config.namespace);
        let nodes = monitor.nodes().await?;
        let control_node = nodes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Configuration("no schedulable nodes in cluster".to_owned()))?;

        let action = Actuator::new(
            cx.clone(),
            &config.namespace,
            control_node,
            config.control_port,
        );
        let stager = FileStager::new(cx.clone(), &config.namespace);

        // Start from a clean namespace so stale pods never skew telemetry.
        action.clean(None).await?;

        info!(image = %config.utilization_server_image, "starting utilization server");
        action
            .create_pod(utilization_server_pod(&config.utilization_server_image), None)
            .await?;
        action
            .create_service(utilization_server_service(), None)
            .await?;

        stager
            .stage_file(
                UTILIZATION_SERVER_APP,
                WORKLOAD_ARCHIVE_NAME,
                &config.workloads_path,
                WORKLOAD_DESTINATION,
                None,
            )
            .await?;
        info!(namespace = %config.namespace, "session ready");

        Ok(Self {
            cx,
            monitor,
            action,
            stager,
        })
    }

    /// Shared context of this session.
    pub fn context(&self) -> Arc<Context<R, Rng>> {
        self.cx.clone()
    }

    /// Tear down everything the session created.
    pub async fn shutdown(self) -> Result<bool, Error> {
        info!("cleaning the cluster before exiting");
        self.action.clean(None).await
    }
}

/// Build a kube client from an explicit kubeconfig path or the environment.
pub async fn client_for(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|err| {
                Error::Configuration(format!(
                    "failed to read kubeconfig '{}': {err}",
                    path.display()
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| {
                    Error::Configuration(format!(
                        "invalid kubeconfig '{}': {err}",
                        path.display()
                    ))
                })?
        }
        None => Config::infer().await.map_err(|err| {
            Error::Configuration(format!("failed to infer cluster config: {err}"))
        })?,
    };
    Ok(Client::try_from(config)?)
}

/// Pod spec of the utilization server.
pub fn utilization_server_pod(image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(UTILIZATION_SERVER_APP.to_owned()),
            labels: managed_labels_extend(selector_labels(UTILIZATION_SERVER_APP)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            hostname: Some(UTILIZATION_SERVER_APP.to_owned()),
            containers: vec![Container {
                name: UTILIZATION_SERVER_APP.to_owned(),
                image: Some(image.to_owned()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// NodePort service spec of the utilization server.
pub fn utilization_server_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(UTILIZATION_SERVER_APP.to_owned()),
            labels: managed_labels_extend(selector_labels(UTILIZATION_SERVER_APP)),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_owned()),
            selector: selector_labels(UTILIZATION_SERVER_APP),
            ports: Some(vec![ServicePort {
                name: Some("web".to_owned()),
                protocol: Some("TCP".to_owned()),
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                node_port: Some(UTILIZATION_NODE_PORT),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Pod spec of a stress workload, one container under the app's selector.
pub fn workload_pod(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: managed_labels_extend(selector_labels(name)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            hostname: Some(name.to_owned()),
            containers: vec![Container {
                name: name.to_owned(),
                image: Some(image.to_owned()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Service spec routing to a stress workload by its app selector.
pub fn workload_service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: managed_labels_extend(selector_labels(name)),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: selector_labels(name),
            ports: Some(vec![ServicePort {
                name: Some("web".to_owned()),
                protocol: Some("TCP".to_owned()),
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}
