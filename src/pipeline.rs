use crate::Error;
use crate::cluster::ClusterApi;
use crate::sink::Sink;
use crate::usage::PodUsage;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

// one row can be queued ahead of the writer, the collector then waits for it
const HANDOFF_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// pods returned by the API server
    pub listed: usize,
    /// pods not in the Running phase
    pub skipped: usize,
    /// CSV rows written to the sink
    pub written: usize,
}

pub fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// Producer: list the pods once, join every running pod with its node and
/// hand the rows over to `tx` in listing order. Dropping `tx` on return is
/// the end-of-stream signal for the writer.
#[instrument(skip(api, tx, clock))]
pub async fn collect_usage<A, C>(
    api: &A,
    tx: mpsc::Sender<PodUsage>,
    clock: C,
) -> Result<Summary, Error>
where
    A: ClusterApi + ?Sized,
    C: Fn() -> DateTime<Utc>,
{
    let pods = api.list_pods().await?;
    let mut summary = Summary {
        listed: pods.len(),
        ..Summary::default()
    };
    for pod in pods.iter() {
        if !is_running(pod) {
            summary.skipped += 1;
            continue;
        }
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        info!(
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod = pod_name.as_str(),
            "Processing pod"
        );

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidObject {
                kind: "Pod",
                name: pod_name.clone(),
                field: "spec.nodeName",
            })?;
        debug!(node = node_name.as_str(), "Getting data for node");
        let node = api
            .get_node(&node_name)
            .await?
            .ok_or_else(|| Error::NodeNotFound {
                name: node_name.clone(),
            })?;

        debug!("Creating pod usage");
        let usage = PodUsage::new(pod, &node, clock())?;
        tx.send(usage)
            .await
            .map_err(|_| Error::ConsumerGone { pod: pod_name })?;
    }
    info!(
        listed = summary.listed,
        skipped = summary.skipped,
        "Done usage collection"
    );
    Ok(summary)
}

/// Consumer: write the CSV header, then one row per received usage, in the
/// order received, until the producer hangs up. Returns the number of rows.
#[instrument(skip(rx, sink))]
pub async fn write_usage<S>(mut rx: mpsc::Receiver<PodUsage>, sink: &mut S) -> Result<usize, Error>
where
    S: Sink + ?Sized,
{
    let header = encode_row(|w| w.write_record(PodUsage::COLUMNS))?;
    sink.write_all(&header).await?;
    let mut written = 0;
    while let Some(usage) = rx.recv().await {
        let row = encode_row(|w| w.serialize(&usage))?;
        sink.write_all(&row).await?;
        written += 1;
    }
    Ok(written)
}

fn encode_row<F>(write: F) -> Result<Vec<u8>, Error>
where
    F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    write(&mut writer)?;
    writer.into_inner().map_err(|e| Error::SinkIoError {
        context: "encode a CSV row".to_string(),
        source: e.into_error(),
    })
}

/// Run the collector as its own task and drain its rows into `sink` from the
/// current one. The sink is closed only when every row made it through;
/// on any error it is dropped unclosed, so nothing partial gets published.
#[instrument(skip(api, sink, clock))]
pub async fn run_collection<A, C>(
    api: Arc<A>,
    mut sink: Box<dyn Sink>,
    clock: C,
) -> Result<Summary, Error>
where
    A: ClusterApi + ?Sized + 'static,
    C: Fn() -> DateTime<Utc> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let collector = tokio::spawn(async move { collect_usage(api.as_ref(), tx, clock).await });

    let written = write_usage(rx, sink.as_mut()).await;
    let collected = collector
        .await
        .map_err(|source| Error::CollectorTaskError { source })?;
    // the writer's error comes first: the collector then only saw a closed channel
    let written = written?;
    let summary = Summary {
        written,
        ..collected?
    };

    sink.close().await?;
    Ok(summary)
}
