//! In-memory cluster objects shared by the unit tests.

use crate::Error;
use crate::cluster::ClusterApi;
use crate::sink::{BoxError, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 6, 1, 12, 0, 0)
        .single()
        .expect("valid date")
}

/// A pod with one container per `(cpu request, memory request)` pair.
pub fn pod(name: &str, phase: &str, node_name: &str, requests: &[(Option<&str>, Option<&str>)]) -> Pod {
    let containers = requests
        .iter()
        .enumerate()
        .map(|(i, (cpu, memory))| {
            let mut resource_list = Map::new();
            if let Some(cpu) = cpu {
                resource_list.insert("cpu".to_string(), json!(cpu));
            }
            if let Some(memory) = memory {
                resource_list.insert("memory".to_string(), json!(memory));
            }
            json!({
                "name": format!("{name}-{i}"),
                "image": "busybox",
                "resources": { "requests": Value::Object(resource_list) },
            })
        })
        .collect::<Vec<_>>();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": "default",
            "uid": format!("uid-{name}"),
        },
        "spec": {
            "nodeName": node_name,
            "containers": containers,
        },
        "status": {
            "phase": phase,
            "startTime": "2017-06-01T10:00:00Z",
        },
    }))
    .expect("valid pod fixture")
}

pub fn running_pod(name: &str, node_name: &str, requests: &[(Option<&str>, Option<&str>)]) -> Pod {
    pod(name, "Running", node_name, requests)
}

pub fn node(name: &str, cpu: Option<&str>, memory: Option<&str>) -> Node {
    let mut capacity = Map::new();
    if let Some(cpu) = cpu {
        capacity.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = memory {
        capacity.insert("memory".to_string(), json!(memory));
    }
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name },
        "spec": { "providerID": format!("aws:///eu-west-1a/i-{name}") },
        "status": { "capacity": Value::Object(capacity) },
    }))
    .expect("valid node fixture")
}

pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    let data = data
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect::<Map<_, _>>();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": Value::Object(data),
    }))
    .expect("valid configmap fixture")
}

#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    pub pods: Vec<Pod>,
    pub nodes: BTreeMap<String, Node>,
    pub config_maps: BTreeMap<(String, String), ConfigMap>,
}

impl FakeCluster {
    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pods.push(pod);
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.insert(name, node);
        self
    }

    pub fn with_config_map(mut self, config_map: ConfigMap) -> Self {
        let key = (
            config_map.metadata.namespace.clone().unwrap_or_default(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        self.config_maps.insert(key, config_map);
        self
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        Ok(self.pods.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(self.nodes.get(name).cloned())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

type Uploads = Arc<Mutex<Vec<(String, String, Vec<u8>)>>>;

/// Object store recording every upload, or refusing all of them.
#[derive(Clone, Default)]
pub struct FakeStore {
    fail: bool,
    uploads: Uploads,
}

impl FakeStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `(bucket, key, content)` of every successful upload, in call order.
    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.uploads.lock().expect("lock uploads").clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: tokio::fs::File,
    ) -> Result<(), BoxError> {
        if self.fail {
            return Err("Access Denied".into());
        }
        let mut content = Vec::new();
        body.read_to_end(&mut content).await?;
        self.uploads
            .lock()
            .expect("lock uploads")
            .push((bucket.to_string(), key.to_string(), content));
        Ok(())
    }
}
