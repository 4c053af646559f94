//! Creates, deletes and migrates pods and services with reconciliation
//! polling.
//!
//! Every mutation blocks until the cluster observably converged: creations
//! poll until the pod phase is `Running`, deletions poll until a read
//! confirms absence. Absence (NotFound) is deliberately treated as the
//! positive completion signal for deletes.
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    core::ObjectMeta,
    Api, Resource, ResourceExt,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    labels::MANAGED_BY_LABEL_SELECTOR,
    namespace::NamespaceReconciler,
    routing::RoutingClient,
    utils::{generate_random_name, wait_for, Context},
};

const POD_RUNNING_PHASE: &str = "Running";
const POD_FAILED_PHASE: &str = "Failed";
const POD_UNKNOWN_PHASE: &str = "Unknown";

/// Address type a control node must expose to be reachable from outside.
const EXTERNAL_IP_ADDRESS_TYPE: &str = "ExternalIP";

/// Outcome of a pod migration.
#[derive(Clone, Debug)]
pub struct Migration {
    /// The pod now serving the workload.
    pub pod: Pod,
    /// The service routing to it.
    pub service: Service,
    /// Whether the workload actually changed placement. `false` reports the
    /// no-op guard: the pod was already on the target node and the inputs
    /// are returned unchanged.
    pub moved: bool,
}

/// Mutating operations against one cluster, scoped to a default namespace.
pub struct Actuator<R, Rng> {
    cx: Arc<Context<R, Rng>>,
    namespaces: NamespaceReconciler<R, Rng>,
    namespace: String,
    control_node: Node,
    control_port: u16,
}

impl<R, Rng> Actuator<R, Rng>
where
    R: RoutingClient,
    Rng: RngCore,
{
    /// Create an actuator.
    ///
    /// `control_node` is the node whose external address reaches the
    /// utilization server during migrations; `control_port` is its node port.
    pub fn new(
        cx: Arc<Context<R, Rng>>,
        namespace: impl Into<String>,
        control_node: Node,
        control_port: u16,
    ) -> Self {
        Self {
            namespaces: NamespaceReconciler::new(cx.clone()),
            cx,
            namespace: namespace.into(),
            control_node,
            control_port,
        }
    }

    fn namespace_or<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(&self.namespace)
    }

    /// Create a pod and wait for it to reach phase `Running`.
    ///
    /// The namespace is ensured first. A terminal `Failed`/`Unknown` phase
    /// surfaces [`Error::PodFailed`]; the wait is bounded by the context's
    /// poll deadline.
    pub async fn create_pod(&self, pod: Pod, namespace: Option<&str>) -> Result<Pod, Error> {
        let ns = self.namespace_or(namespace);
        self.namespaces.ensure(ns).await?;

        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        api.create(&PostParams::default(), &pod)
            .await
            .map_err(|source| Error::ResourceCreate {
                kind: "pod",
                name: name.clone(),
                source,
            })?;

        info!(pod = %name, namespace = %ns, "waiting for pod to run");
        let running = wait_for(
            &self.cx.polling,
            format!("pod '{name}' to reach phase Running"),
            || {
                let api = api.clone();
                let name = name.clone();
                async move {
                    let pod = api.get(&name).await?;
                    let phase = pod.status.as_ref().and_then(|status| status.phase.clone());
                    match phase.as_deref() {
                        Some(POD_RUNNING_PHASE) => Ok(Some(pod)),
                        Some(phase) if phase == POD_FAILED_PHASE || phase == POD_UNKNOWN_PHASE => {
                            Err(Error::PodFailed {
                                name: name.clone(),
                                phase: phase.to_owned(),
                            })
                        }
                        _ => Ok(None),
                    }
                }
            },
        )
        .await?;
        info!(pod = %name, namespace = %ns, "pod is running");
        Ok(running)
    }

    /// Create several pods independently.
    ///
    /// There is no atomicity across the batch: pods created before a failure
    /// stay in place, and the failure is reported once every creation was
    /// attempted.
    pub async fn create_pods(
        &self,
        pods: Vec<Pod>,
        namespace: Option<&str>,
    ) -> Result<Vec<Pod>, Error> {
        let total = pods.len();
        let mut created = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for pod in pods {
            let name = pod.name_any();
            match self.create_pod(pod, namespace).await {
                Ok(pod) => created.push(pod),
                Err(err) => {
                    warn!(%err, pod = %name, "pod in batch did not create");
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            return Err(Error::BatchCreate { failed, total });
        }
        Ok(created)
    }

    /// Create a service. Services have no running phase, so there is no wait
    /// beyond the namespace check.
    pub async fn create_service(
        &self,
        service: Service,
        namespace: Option<&str>,
    ) -> Result<Service, Error> {
        let ns = self.namespace_or(namespace);
        self.namespaces.ensure(ns).await?;

        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.cx.k_client.clone(), ns);
        let created = api
            .create(&PostParams::default(), &service)
            .await
            .map_err(|source| Error::ResourceCreate {
                kind: "service",
                name,
                source,
            })?;
        info!(service = %created.name_any(), namespace = %ns, "service created");
        Ok(created)
    }

    /// Create several services independently. Same batch semantics as
    /// [`Actuator::create_pods`].
    pub async fn create_services(
        &self,
        services: Vec<Service>,
        namespace: Option<&str>,
    ) -> Result<Vec<Service>, Error> {
        let total = services.len();
        let mut created = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for service in services {
            let name = service.name_any();
            match self.create_service(service, namespace).await {
                Ok(service) => created.push(service),
                Err(err) => {
                    warn!(%err, service = %name, "service in batch did not create");
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            return Err(Error::BatchCreate { failed, total });
        }
        Ok(created)
    }

    /// Delete a pod and wait until a read confirms it is gone.
    pub async fn delete_pod(&self, name: &str, namespace: Option<&str>) -> Result<bool, Error> {
        let ns = self.namespace_or(namespace);
        self.delete_and_confirm::<Pod>("pod", name, ns).await
    }

    /// Delete a service and wait until a read confirms it is gone.
    pub async fn delete_service(&self, name: &str, namespace: Option<&str>) -> Result<bool, Error> {
        let ns = self.namespace_or(namespace);
        self.delete_and_confirm::<Service>("service", name, ns)
            .await
    }

    async fn delete_and_confirm<K>(
        &self,
        kind: &'static str,
        name: &str,
        ns: &str,
    ) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.cx.k_client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => {}
            Err(err) => return Err(err.into()),
        }

        wait_for(
            &self.cx.polling,
            format!("{kind} '{name}' to be deleted"),
            || {
                let api = api.clone();
                let name = name.to_owned();
                async move { Ok(api.get_opt(&name).await?.is_none().then_some(())) }
            },
        )
        .await?;
        info!(%kind, %name, namespace = %ns, "resource deleted");
        Ok(true)
    }

    /// Delete every pod of a namespace, then the namespace itself.
    ///
    /// Idempotent: a namespace that is already absent is success, and no
    /// further calls are made beyond the existence check.
    pub async fn clean(&self, namespace: Option<&str>) -> Result<bool, Error> {
        let ns = self.namespace_or(namespace);

        info!(namespace = %ns, "terminating pods");
        let pods: Api<Pod> = Api::namespaced(self.cx.k_client.clone(), ns);
        pods.delete_collection(&DeleteParams::default(), &ListParams::default())
            .await?;

        let namespaces: Api<Namespace> = Api::all(self.cx.k_client.clone());
        if namespaces.get_opt(ns).await?.is_none() {
            debug!(namespace = %ns, "namespace already absent");
            return Ok(true);
        }

        info!(namespace = %ns, "removing namespace");
        match namespaces.delete(ns, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => {}
            Err(err) => return Err(err.into()),
        }

        let name = ns.to_owned();
        wait_for(
            &self.cx.polling,
            format!("namespace '{ns}' to be removed"),
            || {
                let namespaces = namespaces.clone();
                let name = name.clone();
                async move { Ok(namespaces.get_opt(&name).await?.is_none().then_some(())) }
            },
        )
        .await?;
        info!(namespace = %ns, "namespace removed");
        Ok(true)
    }

    /// Clean every namespace the engine manages, returning how many were
    /// cleaned.
    pub async fn clean_all(&self) -> Result<usize, Error> {
        let namespaces: Api<Namespace> = Api::all(self.cx.k_client.clone());
        let managed = namespaces
            .list(&ListParams::default().labels(MANAGED_BY_LABEL_SELECTOR))
            .await?;
        let mut cleaned = 0;
        for ns in managed.items {
            let name = ns.name_any();
            self.clean(Some(&name)).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }

    /// Move a pod to another node by creating a replacement and
    /// decommissioning the original.
    ///
    /// The replacement pod gets a fresh random identity, keeps the source
    /// labels and container spec, and pins `hostname` to the old pod name so
    /// in-cluster DNS stays continuous for the workload. The service is
    /// recreated under the new identity with its cluster IP cleared. The
    /// external controller is told about the rename before the old pair is
    /// deleted.
    ///
    /// A pod already on `target_node` cancels the migration and returns the
    /// inputs unchanged. Failures after the replacement pod exists surface
    /// [`Error::MigrationPartial`] carrying every resource identity involved;
    /// nothing is rolled back.
    pub async fn move_pod(
        &self,
        pod: &Pod,
        service: &Service,
        target_node: &str,
        namespace: Option<&str>,
    ) -> Result<Migration, Error> {
        let ns = self.namespace_or(namespace).to_owned();
        let old_pod_name = pod.name_any();
        let old_service_name = service.name_any();
        let source_node = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default();

        if source_node == target_node {
            info!(
                pod = %old_pod_name,
                node = %source_node,
                "pod already placed on target node, migration cancelled"
            );
            return Ok(Migration {
                pod: pod.clone(),
                service: service.clone(),
                moved: false,
            });
        }

        info!(
            pod = %old_pod_name,
            from = %source_node,
            to = %target_node,
            "migrating pod"
        );

        let new_name = generate_random_name(self.cx.clone());

        let mut pod_spec = pod.spec.clone().unwrap_or_default();
        pod_spec.hostname = Some(old_pod_name.clone());
        pod_spec.node_name = Some(target_node.to_owned());
        let replacement = Pod {
            metadata: ObjectMeta {
                name: Some(new_name.clone()),
                labels: pod.metadata.labels.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(pod_spec),
            ..Pod::default()
        };

        // Nothing has been removed yet, so a failure here leaves the old
        // pair fully intact and the typed create error is enough.
        let new_pod = self.create_pod(replacement, Some(&ns)).await?;

        let mut service_spec = service.spec.clone().unwrap_or_default();
        service_spec.cluster_ip = None;
        service_spec.cluster_ips = None;
        let replacement = Service {
            metadata: ObjectMeta {
                name: Some(new_name.clone()),
                labels: service.metadata.labels.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(service_spec),
            ..Service::default()
        };

        let new_service = match self.create_service(replacement, Some(&ns)).await {
            Ok(service) => service,
            Err(err) => {
                error!(
                    %err,
                    pod = %old_pod_name,
                    new_pod = %new_pod.name_any(),
                    "service creation failed mid-migration, new pod is not routable"
                );
                return Err(Error::MigrationPartial {
                    old_pod: old_pod_name,
                    old_service: old_service_name,
                    new_pod: Some(new_name),
                    new_service: None,
                    reason: format!("service creation failed: {err}"),
                });
            }
        };

        let endpoint = match self.control_endpoint() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                error!(
                    %err,
                    old_pod = %old_pod_name,
                    new_pod = %new_name,
                    "control node is unreachable, both pod generations remain in place"
                );
                return Err(err);
            }
        };

        if let Err(err) = self
            .cx
            .routing_client
            .update_hostname(endpoint, old_service_name.clone(), new_name.clone())
            .await
        {
            error!(
                %err,
                old = %old_service_name,
                new = %new_name,
                "routing update failed, both pod generations remain in place"
            );
            return Err(Error::MigrationPartial {
                old_pod: old_pod_name,
                old_service: old_service_name,
                new_pod: Some(new_name),
                new_service: Some(new_service.name_any()),
                reason: format!("hostname update failed: {err}"),
            });
        }
        info!(old = %old_service_name, new = %new_name, "routing table updated");

        info!(pod = %old_pod_name, node = %source_node, "deleting previous pod");
        self.delete_pod(&old_pod_name, Some(&ns)).await?;

        info!(service = %old_service_name, "deleting previous service");
        self.delete_service(&old_service_name, Some(&ns)).await?;

        info!(pod = %new_pod.name_any(), node = %target_node, "migration done");
        Ok(Migration {
            pod: new_pod,
            service: new_service,
            moved: true,
        })
    }

    /// Externally reachable endpoint of the control node's utilization
    /// server.
    pub fn control_endpoint(&self) -> Result<String, Error> {
        let address = self
            .control_node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addresses| {
                addresses
                    .iter()
                    .find(|address| address.type_ == EXTERNAL_IP_ADDRESS_TYPE)
            })
            .map(|address| address.address.clone())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "node '{}' has no {EXTERNAL_IP_ADDRESS_TYPE} address",
                    self.control_node.name_any()
                ))
            })?;
        Ok(format!("http://{address}:{}", self.control_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::selector_labels;
    use crate::routing::RoutingClientMock;
    use crate::utils::test::{timeout_after_1s, NoRouting, Step};
    use expect_test::{expect, Expect};
    use k8s_openapi::api::core::v1::{
        Container, NodeAddress, NodeStatus, PodSpec, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use serde_json::json;
    use tracing_test::traced_test;
    use unimock::{matching, MockFn, Unimock};

    /// Name the mock rng deterministically assigns to a migrated pair.
    const MIGRATED_NAME: &str = "1d000000000000002400000000000000";

    fn control_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_owned()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: "198.51.100.10".to_owned(),
                    type_: EXTERNAL_IP_ADDRESS_TYPE.to_owned(),
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    fn sample_pod(node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("podx".to_owned()),
                labels: selector_labels("stress"),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "stress".to_owned(),
                    image: Some("r0ot/stress".to_owned()),
                    ..Container::default()
                }],
                node_name: Some(node.to_owned()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    fn sample_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("podx".to_owned()),
                labels: selector_labels("stress"),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.55".to_owned()),
                ports: Some(vec![ServicePort {
                    name: Some("web".to_owned()),
                    port: 80,
                    protocol: Some("TCP".to_owned()),
                    target_port: Some(IntOrString::Int(80)),
                    ..ServicePort::default()
                }]),
                selector: selector_labels("stress"),
                type_: Some("NodePort".to_owned()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn active_ns() -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "ns1" },
            "status": { "phase": "Active" }
        })
    }

    fn status_success() -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Success"
        })
    }

    fn pod_with_phase(name: &str, phase: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "ns1" },
            "status": { "phase": phase }
        })
    }

    fn get_ns_step() -> Step {
        Step::ok(
            expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1",
                    body: ,
                }"#]],
            active_ns(),
        )
    }

    fn get_pod_expect(name: &str) -> Expect {
        match name {
            "podx" => expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1/pods/podx",
                    body: ,
                }"#]],
            _ => expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1/pods/1d000000000000002400000000000000",
                    body: ,
                }"#]],
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn create_pod_returns_only_after_observing_running() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/pods",
    body: {
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "podx"
  },
  "spec": {
    "containers": [
      {
        "image": "r0ot/stress",
        "name": "stress"
      }
    ],
    "nodeName": "node-1"
  }
},
}"#]],
                pod_with_phase("podx", "Pending"),
            ),
            Step::ok(get_pod_expect("podx"), pod_with_phase("podx", "Pending")),
            Step::ok(get_pod_expect("podx"), pod_with_phase("podx", "Running")),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let pod = actuator
            .create_pod(sample_pod("node-1"), None)
            .await
            .expect("pod should run");
        let phase = pod.status.as_ref().and_then(|s| s.phase.clone());
        assert_eq!(phase.as_deref(), Some(POD_RUNNING_PHASE));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_pod_polls_until_absence_is_confirmed() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/pods/podx",
                        body: {},
                    }"#]],
                status_success(),
            ),
            // Still terminating on the first read.
            Step::ok(get_pod_expect("podx"), pod_with_phase("podx", "Running")),
            Step::not_found(get_pod_expect("podx")),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let deleted = actuator.delete_pod("podx", None).await.expect("delete");
        assert!(deleted);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn clean_of_an_absent_namespace_stops_at_the_existence_check() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/pods",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1",
                    body: ,
                }"#]]),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let cleaned = actuator.clean(None).await.expect("clean");
        assert!(cleaned);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn clean_removes_the_namespace_and_waits_for_absence() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/pods",
                        body: {},
                    }"#]],
                status_success(),
            ),
            get_ns_step(),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1",
                        body: {},
                    }"#]],
                status_success(),
            ),
            // Terminating, still present.
            Step::ok(
                expect![[r#"
                    Request {
                        method: "GET",
                        uri: "/api/v1/namespaces/ns1",
                        body: ,
                    }"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "name": "ns1" },
                    "status": { "phase": "Terminating" }
                }),
            ),
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1",
                    body: ,
                }"#]]),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        assert!(actuator.clean(None).await.expect("clean"));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn move_pod_to_the_current_node_is_a_no_op() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let outcome = actuator
            .move_pod(&sample_pod("node-1"), &sample_service(), "node-1", None)
            .await
            .expect("migration should cancel cleanly");
        assert!(!outcome.moved);
        assert_eq!(outcome.pod.name_any(), "podx");
        assert_eq!(outcome.service.name_any(), "podx");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn move_pod_relocates_and_decommissions_the_old_pair() {
        let routing = Unimock::new(
            RoutingClientMock::update_hostname
                .next_call(matching!(_))
                .returns(Ok(())),
        );
        let (cx, api) = Context::test(routing);
        let mocksrv = api.run(vec![
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/pods",
    body: {
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "containers": [
      {
        "image": "r0ot/stress",
        "name": "stress"
      }
    ],
    "hostname": "podx",
    "nodeName": "node-2"
  }
},
}"#]],
                pod_with_phase(MIGRATED_NAME, "Pending"),
            ),
            Step::ok(
                get_pod_expect(MIGRATED_NAME),
                json!({
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": { "name": MIGRATED_NAME, "namespace": "ns1" },
                    "spec": { "nodeName": "node-2", "hostname": "podx" },
                    "status": { "phase": "Running" }
                }),
            ),
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/services",
    body: {
  "apiVersion": "v1",
  "kind": "Service",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "ports": [
      {
        "name": "web",
        "port": 80,
        "protocol": "TCP",
        "targetPort": 80
      }
    ],
    "selector": {
      "app": "stress"
    },
    "type": "NodePort"
  }
},
}"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": MIGRATED_NAME, "namespace": "ns1" }
                }),
            ),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/pods/podx",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(get_pod_expect("podx")),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/services/podx",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1/services/podx",
                    body: ,
                }"#]]),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let outcome = actuator
            .move_pod(&sample_pod("node-1"), &sample_service(), "node-2", None)
            .await
            .expect("migration should complete");
        assert!(outcome.moved);
        assert_eq!(outcome.pod.name_any(), MIGRATED_NAME);
        let node = outcome
            .pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone());
        assert_eq!(node.as_deref(), Some("node-2"));
        assert_eq!(outcome.service.name_any(), MIGRATED_NAME);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn move_pod_surfaces_partial_state_when_the_controller_rejects() {
        let routing = Unimock::new(
            RoutingClientMock::update_hostname
                .next_call(matching!(_))
                .returns(Err(anyhow::anyhow!("response is: 503"))),
        );
        let (cx, api) = Context::test(routing);
        // Both generations stay in place: no deletes are scripted.
        let mocksrv = api.run(vec![
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/pods",
    body: {
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "containers": [
      {
        "image": "r0ot/stress",
        "name": "stress"
      }
    ],
    "hostname": "podx",
    "nodeName": "node-2"
  }
},
}"#]],
                pod_with_phase(MIGRATED_NAME, "Pending"),
            ),
            Step::ok(
                get_pod_expect(MIGRATED_NAME),
                pod_with_phase(MIGRATED_NAME, "Running"),
            ),
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/services",
    body: {
  "apiVersion": "v1",
  "kind": "Service",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "ports": [
      {
        "name": "web",
        "port": 80,
        "protocol": "TCP",
        "targetPort": 80
      }
    ],
    "selector": {
      "app": "stress"
    },
    "type": "NodePort"
  }
},
}"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": MIGRATED_NAME, "namespace": "ns1" }
                }),
            ),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let err = actuator
            .move_pod(&sample_pod("node-1"), &sample_service(), "node-2", None)
            .await
            .expect_err("migration should report partial state");
        match err {
            Error::MigrationPartial {
                old_pod,
                old_service,
                new_pod,
                new_service,
                ..
            } => {
                assert_eq!(old_pod, "podx");
                assert_eq!(old_service, "podx");
                assert_eq!(new_pod.as_deref(), Some(MIGRATED_NAME));
                assert_eq!(new_service.as_deref(), Some(MIGRATED_NAME));
            }
            other => panic!("unexpected error: {other}"),
        }
        timeout_after_1s(mocksrv).await;
    }

    /// Full lifecycle: fresh namespace, workload creation, first metrics
    /// scrape, then migration to another node.
    #[tokio::test]
    #[traced_test]
    async fn workload_lifecycle_from_namespace_to_migration() {
        let routing = Unimock::new(
            RoutingClientMock::update_hostname
                .next_call(matching!(_))
                .returns(Ok(())),
        );
        let (cx, api) = Context::test(routing);
        let running_pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "podx",
                "namespace": "ns1",
                "labels": { "app": "stress" }
            },
            "spec": {
                "containers": [ { "name": "stress", "image": "r0ot/stress" } ],
                "nodeName": "node-1"
            },
            "status": { "phase": "Running" }
        });
        let metrics_get = || {
            expect![[r#"
                Request {
                    method: "GET",
                    uri: "/apis/metrics.k8s.io/v1beta1/namespaces/ns1/pods",
                    body: ,
                }"#]]
        };
        let mocksrv = api.run(vec![
            // Namespace is created on first use and polled to Active.
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1",
                    body: ,
                }"#]]),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces",
    body: {
  "apiVersion": "v1",
  "kind": "Namespace",
  "metadata": {
    "labels": {
      "managed-by": "parkour"
    },
    "name": "ns1"
  }
},
}"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "name": "ns1" }
                }),
            ),
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/pods",
    body: {
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "podx"
  },
  "spec": {
    "containers": [
      {
        "image": "r0ot/stress",
        "name": "stress"
      }
    ],
    "nodeName": "node-1"
  }
},
}"#]],
                pod_with_phase("podx", "Pending"),
            ),
            Step::ok(get_pod_expect("podx"), running_pod.clone()),
            // Metrics have warm-up latency; the first scrape is empty.
            Step::ok(metrics_get(), json!({ "items": [] })),
            Step::ok(
                metrics_get(),
                json!({
                    "items": [
                        {
                            "metadata": { "name": "podx", "namespace": "ns1" },
                            "timestamp": "2024-01-15T10:30:00Z",
                            "containers": [
                                { "name": "stress", "usage": { "cpu": "150m", "memory": "200Mi" } }
                            ]
                        }
                    ]
                }),
            ),
            // Migration: replacement pair comes up before the old one goes.
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/pods",
    body: {
  "apiVersion": "v1",
  "kind": "Pod",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "containers": [
      {
        "image": "r0ot/stress",
        "name": "stress"
      }
    ],
    "hostname": "podx",
    "nodeName": "node-2"
  }
},
}"#]],
                pod_with_phase(MIGRATED_NAME, "Pending"),
            ),
            Step::ok(
                get_pod_expect(MIGRATED_NAME),
                pod_with_phase(MIGRATED_NAME, "Running"),
            ),
            get_ns_step(),
            Step::ok(
                expect![[r#"
Request {
    method: "POST",
    uri: "/api/v1/namespaces/ns1/services",
    body: {
  "apiVersion": "v1",
  "kind": "Service",
  "metadata": {
    "labels": {
      "app": "stress"
    },
    "name": "1d000000000000002400000000000000"
  },
  "spec": {
    "ports": [
      {
        "name": "web",
        "port": 80,
        "protocol": "TCP",
        "targetPort": 80
      }
    ],
    "selector": {
      "app": "stress"
    },
    "type": "NodePort"
  }
},
}"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": MIGRATED_NAME, "namespace": "ns1" }
                }),
            ),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/pods/podx",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(get_pod_expect("podx")),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/ns1/services/podx",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/ns1/services/podx",
                    body: ,
                }"#]]),
        ]);

        let monitor = crate::monitor::Monitor::new(cx.clone(), "ns1");
        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);

        let pod = actuator
            .create_pod(sample_pod("node-1"), None)
            .await
            .expect("workload should run");

        let usage = monitor
            .pods_usage(None)
            .await
            .expect("usage should resolve");
        assert_eq!(
            usage["podx"].cpu,
            k8s_openapi::apimachinery::pkg::api::resource::Quantity("150m".to_owned())
        );

        let outcome = actuator
            .move_pod(&pod, &sample_service(), "node-2", None)
            .await
            .expect("migration should complete");
        assert!(outcome.moved);
        assert_eq!(outcome.pod.name_any(), MIGRATED_NAME);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn clean_all_sweeps_every_managed_namespace() {
        let (cx, api) = Context::test(NoRouting);
        let mocksrv = api.run(vec![
            Step::ok(
                expect![[r#"
                    Request {
                        method: "GET",
                        uri: "/api/v1/namespaces?labelSelector=managed-by%3Dparkour",
                        body: ,
                    }"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "NamespaceList",
                    "metadata": {},
                    "items": [
                        {
                            "metadata": { "name": "vpa" },
                            "status": { "phase": "Active" }
                        }
                    ]
                }),
            ),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/vpa/pods",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "GET",
                        uri: "/api/v1/namespaces/vpa",
                        body: ,
                    }"#]],
                json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "name": "vpa" },
                    "status": { "phase": "Active" }
                }),
            ),
            Step::ok(
                expect![[r#"
                    Request {
                        method: "DELETE",
                        uri: "/api/v1/namespaces/vpa",
                        body: {},
                    }"#]],
                status_success(),
            ),
            Step::not_found(expect![[r#"
                Request {
                    method: "GET",
                    uri: "/api/v1/namespaces/vpa",
                    body: ,
                }"#]]),
        ]);

        let actuator = Actuator::new(cx, "ns1", control_node(), 30000);
        let cleaned = actuator.clean_all().await.expect("sweep");
        assert_eq!(cleaned, 1);
        timeout_after_1s(mocksrv).await;
    }
}
