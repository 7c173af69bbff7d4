//! `ClusterClient` over the Kubernetes API

use anyhow::{Context, Result};
use async_trait::async_trait;
use harness_lib::{
    ClusterClient, PhysicalNode, PodEvent, PodEventStream, PodKey, PodPhase, Selector, Taint,
    WorkloadUnit,
};
use k8s_openapi::api::core::v1::{Namespace, Node, NodeCondition, Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use tokio_stream::StreamExt;
use tracing::{debug, info};

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, selector: &Selector) -> Api<Pod> {
        match &selector.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut params = ListParams::default();
    if !selector.label_selector.is_empty() {
        params = params.labels(&selector.label_selector);
    }
    if !selector.field_selector.is_empty() {
        params = params.fields(&selector.field_selector);
    }
    params
}

fn watcher_config(selector: &Selector) -> watcher::Config {
    let mut config = watcher::Config::default();
    if !selector.label_selector.is_empty() {
        config = config.labels(&selector.label_selector);
    }
    if !selector.field_selector.is_empty() {
        config = config.fields(&selector.field_selector);
    }
    config
}

fn pod_key(meta: &ObjectMeta) -> PodKey {
    PodKey::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn is_true(conditions: Option<&Vec<PodCondition>>, kind: &str) -> bool {
    conditions
        .into_iter()
        .flatten()
        .any(|c| c.type_ == kind && c.status == "True")
}

pub fn to_workload_unit(pod: &Pod) -> WorkloadUnit {
    let key = pod_key(&pod.metadata);
    let status = pod.status.as_ref();
    let phase = PodPhase::from_api(status.and_then(|s| s.phase.as_deref()).unwrap_or_default());

    let mut unit = WorkloadUnit::new(key.namespace, key.name, phase)
        .with_ready(is_true(status.and_then(|s| s.conditions.as_ref()), "Ready"));
    unit.node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    unit.labels = pod.metadata.labels.clone().unwrap_or_default();
    unit.terminating = pod.metadata.deletion_timestamp.is_some();
    unit
}

fn node_ready(conditions: Option<&Vec<NodeCondition>>) -> bool {
    conditions
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

pub fn to_physical_node(node: &Node) -> PhysicalNode {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let spec = node.spec.as_ref();
    let status = node.status.as_ref();

    let taints = spec
        .and_then(|s| s.taints.as_ref())
        .into_iter()
        .flatten()
        .map(|t| Taint {
            key: t.key.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
        })
        .collect();

    let addresses = status.and_then(|s| s.addresses.as_ref());
    let address_of = |kind: &str| {
        addresses
            .into_iter()
            .flatten()
            .find(|a| a.type_ == kind)
            .map(|a| a.address.clone())
    };

    PhysicalNode {
        name: node.metadata.name.clone().unwrap_or_default(),
        schedulable: !spec.and_then(|s| s.unschedulable).unwrap_or(false),
        ready: node_ready(status.and_then(|s| s.conditions.as_ref())),
        taints,
        zone: labels.get(ZONE_LABEL).cloned(),
        address: address_of("ExternalIP").or_else(|| address_of("InternalIP")),
        labels,
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<PhysicalNode>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        Ok(nodes.items.iter().map(to_physical_node).collect())
    }

    async fn list_pods(&self, selector: &Selector) -> Result<Vec<WorkloadUnit>> {
        let pods = self
            .pods(selector)
            .list(&list_params(selector))
            .await
            .with_context(|| format!("Failed to list pods ({selector})"))?;
        Ok(pods.items.iter().map(to_workload_unit).collect())
    }

    async fn watch_pods(&self, selector: &Selector) -> Result<Option<PodEventStream>> {
        let stream = watcher(self.pods(selector), watcher_config(selector));
        let events = stream.map(|event| -> Result<PodEvent> {
            let event = event.context("Pod watch failed")?;
            Ok(match event {
                watcher::Event::Applied(pod) => PodEvent::Applied(to_workload_unit(&pod)),
                watcher::Event::Deleted(pod) => PodEvent::Deleted(pod_key(&pod.metadata)),
                watcher::Event::Restarted(pods) => {
                    PodEvent::Restarted(pods.iter().map(to_workload_unit).collect())
                }
            })
        });
        Ok(Some(Box::pin(events)))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create namespace {name}")),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete namespace {name}")),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get namespace {name}"))?;
        Ok(ns.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus, PodSpec, PodStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_pod_conversion() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                namespace: Some("load".into()),
                labels: Some(BTreeMap::from([("app".into(), "web".into())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "False".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let unit = to_workload_unit(&pod);
        assert_eq!(unit.key(), PodKey::new("load", "web-0"));
        assert_eq!(unit.phase, PodPhase::Running);
        assert_eq!(unit.node_name, "node-1");
        assert!(!unit.ready);
        assert!(!unit.terminating);
        assert_eq!(unit.labels["app"], "web");
    }

    #[test]
    fn test_node_conversion() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                labels: Some(BTreeMap::from([(ZONE_LABEL.into(), "us-central1-a".into())])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                taints: Some(vec![k8s_openapi::api::core::v1::Taint {
                    key: "dedicated".into(),
                    effect: "NoSchedule".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".into(),
                    address: "10.0.0.7".into(),
                }]),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let converted = to_physical_node(&node);
        assert!(!converted.schedulable);
        assert!(converted.ready);
        assert_eq!(converted.zone.as_deref(), Some("us-central1-a"));
        assert_eq!(converted.address.as_deref(), Some("10.0.0.7"));
        assert!(converted.taints[0].blocks_scheduling());
    }
}
