//! Kubernetes-backed [`ClusterCompute`]. Talks to the cluster exclusively through `kube`;
//! nothing outside this module knows a `k8s_openapi` type exists.

use crate::error::{Error, Result};
use crate::types::{Node, Pod, PodEvent, PodPhase, PodSpec, ServiceRef, ServiceSpec};
use crate::ClusterCompute;
use async_trait::async_trait;
use futures::AsyncWriteExt;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Event, Node as K8sNode, Pod as K8sPod, PodSpec as K8sPodSpec, ResourceRequirements,
    Service as K8sService, ServicePort, ServiceSpec as K8sServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;

pub struct K8sCompute {
    client: Client,
    /// The namespace user sandboxes live in; distinct from where the adapter itself runs.
    sandbox_namespace: String,
}

impl K8sCompute {
    pub async fn from_default_context(sandbox_namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Transient { operation: "kube client init".to_string(), reason: e.to_string() })?;
        Ok(Self { client, sandbox_namespace: sandbox_namespace.into() })
    }

    pub fn new(client: Client, sandbox_namespace: impl Into<String>) -> Self {
        Self { client, sandbox_namespace: sandbox_namespace.into() }
    }

    fn classify(op: &str, e: kube::Error) -> Error {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound { what: op.to_string(), id: resp.reason.clone() },
            kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => {
                Error::Transient { operation: op.to_string(), reason: resp.message.clone() }
            }
            _ => Error::Permanent { operation: op.to_string(), reason: e.to_string() },
        }
    }
}

fn node_gpu_count(node: &K8sNode) -> u32 {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("nvidia.com/gpu"))
        .and_then(|q| q.0.parse::<u32>().ok())
        .unwrap_or(0)
}

fn node_ready(node: &K8sNode) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn node_schedulable(node: &K8sNode) -> bool {
    !node.spec.as_ref().map(|s| s.unschedulable.unwrap_or(false)).unwrap_or(false)
}

#[async_trait]
impl ClusterCompute for K8sCompute {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(|e| Self::classify("list_nodes", e))?;
        Ok(list
            .items
            .into_iter()
            .map(|n| Node {
                name: n.metadata.name.clone().unwrap_or_default(),
                labels: n.metadata.labels.clone().unwrap_or_default().into_iter().collect(),
                ready: node_ready(&n),
                schedulable: node_schedulable(&n),
                advertised_gpus: node_gpu_count(&n),
            })
            .collect())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = api.list(&lp).await.map_err(|e| Self::classify("list_pods", e))?;
        Ok(list
            .items
            .into_iter()
            .map(|p| {
                let phase = p
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|s| match s {
                        "Pending" => PodPhase::Pending,
                        "Running" => PodPhase::Running,
                        "Succeeded" => PodPhase::Succeeded,
                        "Failed" => PodPhase::Failed,
                        _ => PodPhase::Unknown,
                    })
                    .unwrap_or(PodPhase::Unknown);
                let requested_gpus = p
                    .spec
                    .as_ref()
                    .map(|s| {
                        s.containers
                            .iter()
                            .filter_map(|c| c.resources.as_ref())
                            .filter_map(|r| r.requests.as_ref())
                            .filter_map(|req| req.get("nvidia.com/gpu"))
                            .filter_map(|q| q.0.parse::<u32>().ok())
                            .sum()
                    })
                    .unwrap_or(0);
                Pod {
                    name: p.metadata.name.clone().unwrap_or_default(),
                    namespace: p.metadata.namespace.clone().unwrap_or_default(),
                    node_name: p.spec.as_ref().and_then(|s| s.node_name.clone()),
                    phase,
                    requested_gpus,
                    start_time: p.status.as_ref().and_then(|s| s.start_time.as_ref()).map(|t| t.0),
                    labels: p.metadata.labels.clone().unwrap_or_default().into_iter().collect(),
                }
            })
            .collect())
    }

    async fn pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<PodEvent>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.name={pod_name}"));
        let list = api.list(&lp).await.map_err(|e| Self::classify("pod_events", e))?;
        Ok(list
            .items
            .into_iter()
            .map(|e| PodEvent {
                reason: e.reason.unwrap_or_default(),
                message: e.message.unwrap_or_default(),
                last_seen: e
                    .last_timestamp
                    .map(|t| t.0)
                    .or_else(|| e.event_time.map(|t| t.0))
                    .unwrap_or_else(chrono::Utc::now),
            })
            .collect())
    }

    async fn create_pod(&self, spec: PodSpec) -> Result<()> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), &spec.namespace);

        // Deterministic naming makes redelivery of a `create` message a detected no-op
        // instead of a duplicate.
        if api.get_opt(&spec.name).await.map_err(|e| Self::classify("create_pod", e))?.is_some() {
            tracing::info!(pod = %spec.name, "sandbox pod already exists, adopting");
            return Ok(());
        }

        let mut resources = BTreeMap::new();
        if spec.gpu_count > 0 {
            resources.insert("nvidia.com/gpu".to_string(), Quantity(spec.gpu_count.to_string()));
        }
        if let Some(cpu) = spec.cpu_millis {
            resources.insert("cpu".to_string(), Quantity(format!("{cpu}m")));
        }
        if let Some(mem) = spec.memory_mb {
            resources.insert("memory".to_string(), Quantity(format!("{mem}Mi")));
        }

        let mut node_selector = BTreeMap::new();
        if let Some(first) = spec.node_names.first() {
            node_selector.insert("kubernetes.io/hostname".to_string(), first.clone());
        }

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None })
            .collect();

        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(spec.namespace.clone()),
                labels: Some(spec.labels.into_iter().collect()),
                ..Default::default()
            },
            spec: Some(K8sPodSpec {
                node_selector: Some(node_selector),
                containers: vec![Container {
                    name: "sandbox".to_string(),
                    image: Some(spec.image),
                    env: Some(env),
                    resources: Some(ResourceRequirements {
                        limits: Some(resources.clone()),
                        requests: Some(resources),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        api.create(&PostParams::default(), &pod).await.map_err(|e| Self::classify("create_pod", e))?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str, grace_seconds: u32) -> Result<()> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        let mut dp = DeleteParams::default();
        dp.grace_period_seconds = Some(grace_seconds);
        match api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Self::classify("delete_pod", e)),
        }
    }

    async fn create_service(&self, spec: ServiceSpec) -> Result<ServiceRef> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), &spec.namespace);

        if let Some(existing) = api.get_opt(&spec.name).await.map_err(|e| Self::classify("create_service", e))? {
            let port = existing
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .and_then(|p| p.node_port)
                .unwrap_or(0) as u16;
            return Ok(ServiceRef { name: spec.name, host: format!("{}.{}.svc", existing.metadata.name.unwrap_or_default(), spec.namespace), port });
        }

        let mut ports = vec![ServicePort {
            name: Some("ssh".to_string()),
            port: 22,
            target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(spec.ssh_target_port as i32)),
            ..Default::default()
        }];
        for (name, port, target) in &spec.extra_ports {
            ports.push(ServicePort {
                name: Some(name.clone()),
                port: *port as i32,
                target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(*target as i32)),
                ..Default::default()
            });
        }

        let svc = K8sService {
            metadata: ObjectMeta { name: Some(spec.name.clone()), namespace: Some(spec.namespace.clone()), ..Default::default() },
            spec: Some(K8sServiceSpec {
                selector: Some(spec.selector_labels.into_iter().collect()),
                ports: Some(ports),
                type_: Some("NodePort".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = api.create(&PostParams::default(), &svc).await.map_err(|e| Self::classify("create_service", e))?;
        let node_port = created
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| p.node_port)
            .unwrap_or(0) as u16;

        Ok(ServiceRef { name: spec.name.clone(), host: format!("{}.{}.svc", spec.name, spec.namespace), port: node_port })
    }

    async fn delete_service(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Self::classify("delete_service", e)),
        }
    }

    async fn write_file_in_pod(&self, namespace: &str, pod: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        let mut process = api
            .exec(pod, vec!["sh", "-c", &format!("cat > {path}")], &AttachParams::default().stdin(true).stdout(false).stderr(false))
            .await
            .map_err(|e| Self::classify("write_file_in_pod", e))?;

        let mut stdin = process.stdin().ok_or_else(|| Error::Permanent {
            operation: "write_file_in_pod".to_string(),
            reason: "exec stdin unavailable".to_string(),
        })?;
        stdin.write_all(bytes).await.map_err(|e| Error::Transient { operation: "write_file_in_pod".to_string(), reason: e.to_string() })?;
        stdin.close().await.map_err(|e| Error::Transient { operation: "write_file_in_pod".to_string(), reason: e.to_string() })?;

        process.join().await.map_err(|e| Self::classify("write_file_in_pod", e))?;
        Ok(())
    }
}
