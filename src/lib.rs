pub mod cluster;
pub mod pipeline;
pub mod qty;
pub mod sink;
pub mod usage;

#[cfg(test)]
mod fixtures;

use chrono::Utc;
use clap::Parser;
use cluster::{KubeClusterApi, get_cluster_id};
use sink::{BoxError, Destination, SUPPORTED_SCHEMES};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};
use usage::{ResourceKind, Subject};

pub use pipeline::Summary;
pub use usage::PodUsage;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("A destination to write collected data to must be given, supported schemes: {}", SUPPORTED_SCHEMES)]
    MissingDestination,

    #[error("A valid destination with scheme ({}) must be given, got '{input}'", SUPPORTED_SCHEMES)]
    InvalidDestination {
        input: String,
        source: url::ParseError,
    },

    #[error("Unknown scheme '{scheme}' given, please provide either {}", SUPPORTED_SCHEMES)]
    UnsupportedScheme { scheme: String },

    #[error("Invalid destination '{input}', {reason}")]
    MalformedDestination { input: String, reason: &'static str },

    #[error("Destination scheme '{scheme}://' needs the '{feature}' feature of this build")]
    SchemeNotEnabled {
        scheme: &'static str,
        feature: &'static str,
    },

    #[error("Failed to {context}")]
    KubeError {
        context: String,
        source: kube::Error,
    },

    #[error("Failed to {context}")]
    KubeConfigError {
        context: String,
        source: kube::config::KubeconfigError,
    },

    #[error("Failed to {context}")]
    KubeInClusterError {
        context: String,
        source: kube::config::InClusterError,
    },

    #[error("Failed to get node '{name}': not found")]
    NodeNotFound { name: String },

    #[error("Failed to get cluster configuration '{namespace}/{name}': not found")]
    ClusterConfigNotFound { namespace: String, name: String },

    #[error("Cluster configuration '{namespace}/{name}' has no '{key}' entry")]
    ClusterIdMissing {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("Missing {field} on {kind} '{name}'")]
    InvalidObject {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("Failed to parse {field}='{input}' of {kind} '{name}'")]
    TimeParseError {
        kind: &'static str,
        name: String,
        field: &'static str,
        input: String,
        source: chrono::ParseError,
    },

    #[error("Failed to read Qty of {subject} {kind}={input} of '{owner}'")]
    ResourceQtyParseError {
        subject: Subject,
        kind: ResourceKind,
        owner: String,
        input: String,
        source: qty::Error,
    },

    #[error("Failed to convert {subject} {kind}={qty} of '{owner}' to an integer")]
    QtyConversionError {
        subject: Subject,
        kind: ResourceKind,
        owner: String,
        qty: String,
    },

    #[error("Failed to {context}")]
    SinkIoError {
        context: String,
        source: std::io::Error,
    },

    #[cfg(feature = "hdfs")]
    #[error("Failed to {context}")]
    HdfsError {
        context: String,
        source: hdfs_native::HdfsError,
    },

    #[error("Failed to write file to s3 bucket '{bucket}' with key '{key}', output has been saved to '{}'", .staging.display())]
    S3UploadError {
        bucket: String,
        key: String,
        staging: PathBuf,
        source: BoxError,
    },

    #[error("Failed to write file to s3 bucket '{bucket}' with key '{key}' ({upload}), then failed to keep the output at '{}'", .staging.display())]
    S3StagingLostError {
        bucket: String,
        key: String,
        staging: PathBuf,
        upload: String,
        source: std::io::Error,
    },

    #[error("Failed to write usage data as CSV")]
    CsvError {
        #[from]
        source: csv::Error,
    },

    #[error("Failed to run the usage collection task")]
    CollectorTaskError { source: tokio::task::JoinError },

    #[error("Failed to hand over the usage of pod '{pod}', the writer has stopped")]
    ConsumerGone { pod: String },
}

#[derive(Parser, Debug)]
#[command(
    version, about,
    after_help("Destinations: file:///path/to/file.csv, hdfs://namenode:port/path/to/file.csv, s3:///bucket/key\nLong flags take two dashes: --id, --kubeconfig, --context, --verbose (not -id, -kubeconfig, ...)"),
    propagate_version = true
)]
pub struct CliOpts {
    /// Where to write the CSV report (file://, hdfs:// or s3://)
    #[arg(required_unless_present = "id", value_parser)]
    pub destination: Option<String>,

    /// Path to the kubeconfig file, in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG", value_parser)]
    pub kubeconfig: Option<PathBuf>,

    /// The name of the kubeconfig context to use
    #[arg(long, value_parser)]
    pub context: Option<String>,

    /// Provides detailed log information
    #[arg(short, long, value_parser)]
    pub verbose: bool,

    /// Does not run the collector, just prints the cluster ID
    #[arg(long, value_parser)]
    pub id: bool,
}

impl CliOpts {
    fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// What a run does, validated from the command line before any API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    ClusterId,
    Collect(Destination),
}

impl TryFrom<&CliOpts> for Mode {
    type Error = Error;

    fn try_from(cli_opts: &CliOpts) -> Result<Self, Self::Error> {
        if cli_opts.id {
            return Ok(Mode::ClusterId);
        }
        let destination = cli_opts
            .destination
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(Error::MissingDestination)?;
        Ok(Mode::Collect(destination.parse()?))
    }
}

pub async fn new_client(cli_opts: &CliOpts) -> Result<kube::Client, Error> {
    let options = kube::config::KubeConfigOptions {
        context: cli_opts.context.clone(),
        ..Default::default()
    };
    let client_config = match (cli_opts.kubeconfig_path(), &cli_opts.context) {
        (Some(path), _) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|source| {
                Error::KubeConfigError {
                    context: format!("read the kubeconfig '{}'", path.display()),
                    source,
                }
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|source| Error::KubeConfigError {
                    context: "create the kube client config".to_string(),
                    source,
                })?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|source| Error::KubeConfigError {
                context: "create the kube client config".to_string(),
                source,
            })?,
        (None, None) => {
            kube::Config::incluster().map_err(|source| Error::KubeInClusterError {
                context: "create the in-cluster kube client config".to_string(),
                source,
            })?
        }
    };
    info!(cluster_url = client_config.cluster_url.to_string().as_str());
    kube::Client::try_from(client_config).map_err(|source| Error::KubeError {
        context: "create the kube client".to_string(),
        source,
    })
}

#[instrument(skip(cli_opts))]
pub async fn do_main(cli_opts: &CliOpts) -> Result<(), Error> {
    let mode = Mode::try_from(cli_opts)?;
    let client = new_client(cli_opts).await?;
    let api = Arc::new(KubeClusterApi::new(client));
    match mode {
        Mode::ClusterId => {
            let cluster_id = get_cluster_id(api.as_ref()).await?;
            println!("{cluster_id}");
        }
        Mode::Collect(destination) => {
            let sink = destination.open().await?;
            let summary = pipeline::run_collection(api, sink, Utc::now).await?;
            info!(
                destination = %destination,
                listed = summary.listed,
                skipped = summary.skipped,
                written = summary.written,
                "Usage report written"
            );
        }
    }
    Ok(())
}
