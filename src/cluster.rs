use crate::workload::Workload;
use anyhow::Context;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use std::future::Future;
use tracing::{debug, info};

static IMAGE_RELOADER_FIELD_MANAGER: &str = "image-reloader";

/// Read and write access to one workload kind in the cluster.
pub trait WorkloadStore<W: Workload>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> impl Future<Output = anyhow::Result<W>> + Send;

    fn replace(
        &self,
        namespace: &str,
        workload: &W,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Everything the dispatcher needs from the cluster.
pub trait ClusterClient:
    WorkloadStore<Deployment> + WorkloadStore<StatefulSet> + 'static
{
}

impl<T> ClusterClient for T where
    T: WorkloadStore<Deployment> + WorkloadStore<StatefulSet> + 'static
{
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl<W: Workload> WorkloadStore<W> for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<W> {
        let api: Api<W> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .with_context(|| format!("Failed to fetch {} {}/{}", W::KIND, namespace, name))
    }

    async fn replace(&self, namespace: &str, workload: &W) -> anyhow::Result<()> {
        let name = workload.name_any();
        let api: Api<W> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(IMAGE_RELOADER_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        debug!("Replacing {} {}/{}", W::KIND, namespace, name);
        api.replace(&name, &params, workload)
            .await
            .with_context(|| format!("Failed to update {} {}/{}", W::KIND, namespace, name))?;
        Ok(())
    }
}
