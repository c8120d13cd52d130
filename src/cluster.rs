use crate::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, ListParams};
use tracing::instrument;

/// Namespace where all Tectonic related resources live.
pub const TECTONIC_NAMESPACE: &str = "tectonic-system";

/// Name of the ConfigMap holding the Tectonic cluster configuration.
pub const TECTONIC_CONFIG_NAME: &str = "tectonic-config";

/// Key in the cluster ConfigMap's data holding the cluster's ID.
pub const CLUSTER_ID_KEY: &str = "clusterID";

/// The calls made to the API server, behind a trait so the collection can run
/// against an in-memory cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Every pod of every namespace, in the order returned by the API server.
    async fn list_pods(&self) -> Result<Vec<Pod>, Error>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    async fn get_config_map(&self, namespace: &str, name: &str)
    -> Result<Option<ConfigMap>, Error>;
}

#[derive(Clone)]
pub struct KubeClusterApi {
    client: kube::Client,
}

impl KubeClusterApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self))]
    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        let api_pods: Api<Pod> = Api::all(self.client.clone());
        let pods = api_pods
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::KubeError {
                context: "list pods".to_string(),
                source,
            })?;
        Ok(pods.items)
    }

    #[instrument(skip(self))]
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api_nodes: Api<Node> = Api::all(self.client.clone());
        api_nodes
            .get_opt(name)
            .await
            .map_err(|source| Error::KubeError {
                context: format!("get node '{name}'"),
                source,
            })
    }

    #[instrument(skip(self))]
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api_config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api_config_maps
            .get_opt(name)
            .await
            .map_err(|source| Error::KubeError {
                context: format!("get configmap '{namespace}/{name}'"),
                source,
            })
    }
}

/// The ID of the cluster, as recorded in the Tectonic configuration.
#[instrument(skip(api))]
pub async fn get_cluster_id<A>(api: &A) -> Result<String, Error>
where
    A: ClusterApi + ?Sized,
{
    let config = api
        .get_config_map(TECTONIC_NAMESPACE, TECTONIC_CONFIG_NAME)
        .await?
        .ok_or_else(|| Error::ClusterConfigNotFound {
            namespace: TECTONIC_NAMESPACE.to_string(),
            name: TECTONIC_CONFIG_NAME.to_string(),
        })?;
    config
        .data
        .and_then(|mut data| data.remove(CLUSTER_ID_KEY))
        .ok_or_else(|| Error::ClusterIdMissing {
            namespace: TECTONIC_NAMESPACE.to_string(),
            name: TECTONIC_CONFIG_NAME.to_string(),
            key: CLUSTER_ID_KEY.to_string(),
        })
}
