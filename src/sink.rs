use crate::Error;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info, instrument};
use url::Url;

pub const SUPPORTED_SCHEMES: &str = "s3://, file://, or hdfs://";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where the report goes, resolved once from the destination URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `file:///path`
    Local { path: PathBuf },
    /// `hdfs://namenode[:port]/path`
    Hdfs { namenode: String, path: String },
    /// `s3:///bucket/key` or `s3://bucket/key`
    S3 { bucket: String, key: String },
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|source| Error::InvalidDestination {
            input: s.to_string(),
            source,
        })?;
        let malformed = |reason| Error::MalformedDestination {
            input: s.to_string(),
            reason,
        };
        let decoded_path = || {
            percent_decode_str(url.path())
                .decode_utf8()
                .map_err(|_| malformed("expected a UTF-8 path"))
        };
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(|path| Destination::Local { path })
                .map_err(|_| malformed("expected an absolute local path")),
            "hdfs" => {
                if url.host_str().unwrap_or_default().is_empty() {
                    return Err(malformed("expected the namenode as host"));
                }
                let path = decoded_path()?;
                if path.len() <= 1 {
                    return Err(malformed("expected a file path"));
                }
                Ok(Destination::Hdfs {
                    namenode: url[..url::Position::BeforePath].to_string(),
                    path: path.into_owned(),
                })
            }
            "s3" => split_bucket_key(url.host_str(), &decoded_path()?)
                .map(|(bucket, key)| Destination::S3 { bucket, key })
                .ok_or_else(|| malformed("expected a bucket name followed by an object key")),
            scheme => Err(Error::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }
}

// "/bucket-name/dir/file" => ("bucket-name", "/dir/file"), the key keeps its leading slash
fn split_bucket_key(host: Option<&str>, path: &str) -> Option<(String, String)> {
    let (bucket, key) = match host.filter(|h| !h.is_empty()) {
        Some(bucket) => (bucket, path),
        None => {
            let path = path.strip_prefix('/')?;
            path.split_at(path.find('/')?)
        }
    };
    (!bucket.is_empty() && key.len() > 1).then(|| (bucket.to_string(), key.to_string()))
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { path } => write!(f, "file://{}", path.display()),
            Self::Hdfs { namenode, path } => write!(f, "{namenode}{path}"),
            Self::S3 { bucket, key } => write!(f, "s3:///{bucket}{key}"),
        }
    }
}

impl Destination {
    /// Open the sink for this destination. The caller must `close` it once
    /// every byte is written.
    #[instrument]
    pub async fn open(&self) -> Result<Box<dyn Sink>, Error> {
        match self {
            Self::Local { path } => Ok(Box::new(LocalSink::create(path).await?)),
            #[cfg(feature = "hdfs")]
            Self::Hdfs { namenode, path } => Ok(Box::new(HdfsSink::create(namenode, path).await?)),
            #[cfg(not(feature = "hdfs"))]
            Self::Hdfs { .. } => Err(Error::SchemeNotEnabled {
                scheme: "hdfs",
                feature: "hdfs",
            }),
            #[cfg(feature = "s3")]
            Self::S3 { bucket, key } => {
                let store = AwsObjectStore::from_env().await;
                Ok(Box::new(S3Sink::create(bucket.clone(), key.clone(), store)?))
            }
            #[cfg(not(feature = "s3"))]
            Self::S3 { .. } => Err(Error::SchemeNotEnabled {
                scheme: "s3",
                feature: "s3",
            }),
        }
    }
}

/// Parse `uri` and open the matching sink.
pub async fn open_sink(uri: &str) -> Result<Box<dyn Sink>, Error> {
    Destination::from_str(uri)?.open().await
}

/// A byte sink written in order by a single owner, then closed exactly once.
#[async_trait]
pub trait Sink: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Flush and release the destination. For object storage this is when
    /// the data is published.
    async fn close(self: Box<Self>) -> Result<(), Error>;
}

pub struct LocalSink {
    path: PathBuf,
    file: tokio::fs::File,
}

impl LocalSink {
    pub async fn create(path: &Path) -> Result<Self, Error> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|source| Error::SinkIoError {
                context: format!("create the file '{}'", path.display()),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

#[async_trait]
impl Sink for LocalSink {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(buf)
            .await
            .map_err(|source| Error::SinkIoError {
                context: format!("write to '{}'", self.path.display()),
                source,
            })
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let LocalSink { path, mut file } = *self;
        file.flush().await.map_err(|source| Error::SinkIoError {
            context: format!("flush '{}'", path.display()),
            source,
        })
    }
}

#[cfg(feature = "hdfs")]
pub struct HdfsSink {
    path: String,
    writer: hdfs_native::file::FileWriter,
}

#[cfg(feature = "hdfs")]
impl HdfsSink {
    pub async fn create(namenode: &str, path: &str) -> Result<Self, Error> {
        let client = hdfs_native::Client::new(namenode).map_err(|source| Error::HdfsError {
            context: format!("create a client for HDFS '{namenode}'"),
            source,
        })?;
        let writer = client
            .create(path, hdfs_native::WriteOptions::default())
            .await
            .map_err(|source| Error::HdfsError {
                context: format!("create the file '{path}' on '{namenode}'"),
                source,
            })?;
        Ok(Self {
            path: path.to_string(),
            writer,
        })
    }
}

#[cfg(feature = "hdfs")]
#[async_trait]
impl Sink for HdfsSink {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.writer
            .write(bytes::Bytes::copy_from_slice(buf))
            .await
            .map_err(|source| Error::HdfsError {
                context: format!("write to '{}'", self.path),
                source,
            })?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let HdfsSink { path, mut writer } = *self;
        writer.close().await.map_err(|source| Error::HdfsError {
            context: format!("close '{path}'"),
            source,
        })
    }
}

/// The single call the s3 sink needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the whole content of `body` (read from its current position) as `bucket`/`key`.
    async fn put_object(&self, bucket: &str, key: &str, body: tokio::fs::File)
    -> Result<(), BoxError>;
}

#[cfg(feature = "s3")]
pub struct AwsObjectStore {
    client: aws_sdk_s3::Client,
}

#[cfg(feature = "s3")]
impl AwsObjectStore {
    /// Client configured from the standard AWS environment (env vars, profile, instance role).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
        }
    }
}

#[cfg(feature = "s3")]
#[async_trait]
impl ObjectStore for AwsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: tokio::fs::File,
    ) -> Result<(), BoxError> {
        let body = aws_sdk_s3::primitives::ByteStream::read_from()
            .file(body)
            .build()
            .await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await?;
        Ok(())
    }
}

/// Object storage can't be streamed to with a plain handle: rows are staged
/// into a private temporary file and uploaded in one call on `close`.
///
/// On upload failure the staging file is kept on disk and its path is part of
/// the returned error, so the report can be recovered by hand. Dropping the
/// sink without `close` removes the staging file and uploads nothing.
pub struct S3Sink<O> {
    bucket: String,
    key: String,
    staging: NamedTempFile,
    file: tokio::fs::File,
    store: O,
}

impl<O: ObjectStore> S3Sink<O> {
    pub fn create(bucket: String, key: String, store: O) -> Result<Self, Error> {
        let staging = tempfile::Builder::new()
            .prefix("pod-data")
            .tempfile()
            .map_err(|source| Error::SinkIoError {
                context: "create a staging file for the s3 upload".to_string(),
                source,
            })?;
        let file = staging
            .as_file()
            .try_clone()
            .map(tokio::fs::File::from_std)
            .map_err(|source| Error::SinkIoError {
                context: format!("open '{}'", staging.path().display()),
                source,
            })?;
        info!(
            bucket = bucket.as_str(),
            key = key.as_str(),
            staging = %staging.path().display(),
            "Writing to a staging file then uploading to s3"
        );
        Ok(Self {
            bucket,
            key,
            staging,
            file,
            store,
        })
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }
}

#[async_trait]
impl<O: ObjectStore + 'static> Sink for S3Sink<O> {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(buf)
            .await
            .map_err(|source| Error::SinkIoError {
                context: format!("write to '{}'", self.staging.path().display()),
                source,
            })
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let S3Sink {
            bucket,
            key,
            staging,
            mut file,
            store,
        } = *self;
        rewind(&mut file)
            .await
            .map_err(|source| Error::SinkIoError {
                context: format!("rewind '{}'", staging.path().display()),
                source,
            })?;

        match store.put_object(&bucket, &key, file).await {
            Ok(()) => {
                let staging_path = staging.path().to_path_buf();
                staging.close().map_err(|source| Error::SinkIoError {
                    context: format!("remove '{}'", staging_path.display()),
                    source,
                })?;
                info!(bucket = bucket.as_str(), key = key.as_str(), "Uploaded to s3");
                Ok(())
            }
            Err(source) => {
                let staging_path = staging.path().to_path_buf();
                if let Err(e) = staging.keep() {
                    return Err(Error::S3StagingLostError {
                        bucket,
                        key,
                        staging: staging_path,
                        upload: source.to_string(),
                        source: e.error,
                    });
                }
                error!(
                    bucket = bucket.as_str(),
                    key = key.as_str(),
                    staging = %staging_path.display(),
                    "Failed to upload to s3, output has been kept"
                );
                Err(Error::S3UploadError {
                    bucket,
                    key,
                    staging: staging_path,
                    source,
                })
            }
        }
    }
}

// flush the staged rows then move back to their start for the upload
async fn rewind(file: &mut tokio::fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(())
}
