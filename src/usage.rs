use crate::Error;
use crate::qty::Qty;
use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    // cpu is reported in millicores, memory in bytes
    fn pow10(&self) -> u32 {
        match self {
            Self::Cpu => 3,
            Self::Memory => 0,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Where a quantity was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    PodRequest,
    NodeCapacity,
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PodRequest => "pod request",
            Self::NodeCapacity => "node capacity",
        };
        f.write_str(s)
    }
}

/// cpu (millicores) and memory (bytes) as plain integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amounts {
    pub cpu: i64,
    pub memory: i64,
}

fn sum_resource<'a>(
    resource_lists: impl Iterator<Item = &'a BTreeMap<String, Quantity>>,
    kind: ResourceKind,
    subject: Subject,
    owner: &str,
) -> Result<i64, Error> {
    let mut total = Qty::zero();
    for resource_list in resource_lists {
        if let Some(value) = resource_list.get(kind.key()) {
            let quantity =
                Qty::from_str(&value.0).map_err(|source| Error::ResourceQtyParseError {
                    subject,
                    kind,
                    owner: owner.to_string(),
                    input: value.0.clone(),
                    source,
                })?;
            total += &quantity;
        }
    }
    total
        .to_scaled_i64(kind.pow10())
        .ok_or_else(|| Error::QtyConversionError {
            subject,
            kind,
            owner: owner.to_string(),
            qty: total.to_string(),
        })
}

/// Sum of the cpu and memory requests of every container of the pod.
/// A container without a request for a resource adds nothing to it.
pub fn compute_requests(pod: &Pod) -> Result<Amounts, Error> {
    let owner = pod.metadata.name.clone().unwrap_or_default();
    let requests = || {
        pod.spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter_map(|c| c.resources.as_ref().and_then(|r| r.requests.as_ref()))
    };
    Ok(Amounts {
        cpu: sum_resource(requests(), ResourceKind::Cpu, Subject::PodRequest, &owner)?,
        memory: sum_resource(requests(), ResourceKind::Memory, Subject::PodRequest, &owner)?,
    })
}

/// The cpu and memory capacity advertised by the node.
pub fn compute_capacity(node: &Node) -> Result<Amounts, Error> {
    let owner = node.metadata.name.clone().unwrap_or_default();
    let capacity = node.status.as_ref().and_then(|s| s.capacity.as_ref());
    Ok(Amounts {
        cpu: sum_resource(
            capacity.into_iter(),
            ResourceKind::Cpu,
            Subject::NodeCapacity,
            &owner,
        )?,
        memory: sum_resource(
            capacity.into_iter(),
            ResourceKind::Memory,
            Subject::NodeCapacity,
            &owner,
        )?,
    })
}

/// `requested / capacity`, and 0 for a node without capacity.
pub fn ratio(requested: i64, capacity: i64) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        requested as f64 / capacity as f64
    }
}

/// One CSV row: the requests of a running pod next to the capacity of its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodUsage {
    /// identifier assigned to the pod by the API server
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// when the kubelet started the pod, possibly before its images were pulled
    #[serde(with = "rfc3339")]
    pub start_time: DateTime<Utc>,
    /// when this row was assembled
    #[serde(with = "rfc3339")]
    pub current_time: DateTime<Utc>,
    /// millicores
    #[serde(rename = "requestedCPU")]
    pub requested_cpu: i64,
    /// bytes
    pub requested_memory: i64,
    pub node_name: String,
    /// identifier of the node assigned by the cloud provider
    #[serde(rename = "nodeExternalName")]
    pub node_external_id: String,
    #[serde(rename = "nodeCPUCapacity")]
    pub node_cpu_capacity: i64,
    pub node_memory_capacity: i64,
    pub memory_percent: f64,
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f64,
}

impl PodUsage {
    /// Header of the CSV output, in field order.
    pub const COLUMNS: [&'static str; 13] = [
        "uid",
        "name",
        "namespace",
        "startTime",
        "currentTime",
        "requestedCPU",
        "requestedMemory",
        "nodeName",
        "nodeExternalName",
        "nodeCPUCapacity",
        "nodeMemoryCapacity",
        "memoryPercent",
        "cpuPercent",
    ];

    /// Build the row of `pod` scheduled on `node`, `now` being the caller's clock reading.
    pub fn new(pod: &Pod, node: &Node, now: DateTime<Utc>) -> Result<Self, Error> {
        let name = required(&pod.metadata.name, "Pod", "", "metadata.name")?;
        let uid = required(&pod.metadata.uid, "Pod", name, "metadata.uid")?;
        let namespace = required(&pod.metadata.namespace, "Pod", name, "metadata.namespace")?;
        let node_name = required(&node.metadata.name, "Node", "", "metadata.name")?;
        let start_time = pod
            .status
            .as_ref()
            .and_then(|s| s.start_time.as_ref())
            .ok_or_else(|| Error::InvalidObject {
                kind: "Pod",
                name: name.to_string(),
                field: "status.startTime",
            })
            .and_then(|t| to_utc(t, name))?;
        let node_external_id = node
            .spec
            .as_ref()
            .and_then(|s| s.external_id.clone().or_else(|| s.provider_id.clone()))
            .unwrap_or_default();

        let requested = compute_requests(pod)?;
        let capacity = compute_capacity(node)?;

        Ok(PodUsage {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            start_time,
            current_time: now.trunc_subsecs(0),
            requested_cpu: requested.cpu,
            requested_memory: requested.memory,
            node_name: node_name.to_string(),
            node_external_id,
            node_cpu_capacity: capacity.cpu,
            node_memory_capacity: capacity.memory,
            memory_percent: ratio(requested.memory, capacity.memory),
            cpu_percent: ratio(requested.cpu, capacity.cpu),
        })
    }
}

fn required<'a>(
    value: &'a Option<String>,
    kind: &'static str,
    name: &str,
    field: &'static str,
) -> Result<&'a str, Error> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidObject {
            kind,
            name: name.to_string(),
            field,
        })
}

// k8s `Time` goes over the wire as RFC 3339, read it back through that form
fn to_utc(time: &Time, pod_name: &str) -> Result<DateTime<Utc>, Error> {
    let input = serde_json::to_value(time)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| Error::InvalidObject {
            kind: "Pod",
            name: pod_name.to_string(),
            field: "status.startTime",
        })?;
    DateTime::parse_from_rfc3339(&input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| Error::TimeParseError {
            kind: "Pod",
            name: pod_name.to_string(),
            field: "status.startTime",
            input,
            source,
        })
}

mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
