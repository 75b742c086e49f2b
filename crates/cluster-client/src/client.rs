//! kube-backed implementation of [`ClusterClient`].

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crate::machine_kind::MachineKind;
use crds::well_known::{CAPI_NODE_GROUP_LABEL, NODE_GROUP_LABEL};
use crds::{Instance, NodeGroup};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use tracing::debug;

/// Page size for list calls.
const PAGE_SIZE: u32 = 500;

/// Object store client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying kube client, used for watches and events.
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    fn machines(&self, kind: MachineKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.machine_resource())
    }

    fn machine_deployments(&self, kind: MachineKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.deployment_resource())
    }
}

/// Lists every object matching `lp`, following continue tokens.
async fn list_all<K>(api: &Api<K>, lp: ListParams) -> Result<Vec<K>, ClusterError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let mut lp = lp.limit(PAGE_SIZE);
    let mut items = Vec::new();
    loop {
        let page = api.list(&lp).await?;
        let token = page.metadata.continue_.clone();
        items.extend(page.items);
        match token {
            Some(token) if !token.is_empty() => lp = lp.continue_token(&token),
            _ => break,
        }
    }
    Ok(items)
}

/// Deletes `name`, treating an already-missing object as success.
async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), ClusterError>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!(name = %name, "Object already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroup>, ClusterError> {
        let api: Api<NodeGroup> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>, ClusterError> {
        let api: Api<NodeGroup> = Api::all(self.client.clone());
        list_all(&api, ListParams::default()).await
    }

    async fn patch_node_group_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        let api: Api<NodeGroup> = Api::all(self.client.clone());
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes_in_group(&self, node_group: &str) -> Result<Vec<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let selector = format!("{}={}", NODE_GROUP_LABEL, node_group);
        list_all(&api, ListParams::default().labels(&selector)).await
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ClusterError> {
        let api: Api<Instance> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_instance(&self, instance: &Instance) -> Result<Instance, ClusterError> {
        let api: Api<Instance> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), instance).await?)
    }

    async fn patch_instance(&self, name: &str, patch: &Value) -> Result<Instance, ClusterError> {
        let api: Api<Instance> = Api::all(self.client.clone());
        Ok(api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?)
    }

    async fn patch_instance_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        let api: Api<Instance> = Api::all(self.client.clone());
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Instance> = Api::all(self.client.clone());
        delete_ignoring_missing(&api, name).await
    }

    async fn get_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self.machines(kind, namespace).get_opt(name).await?)
    }

    async fn list_machines(&self, kind: MachineKind, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        list_all(&self.machines(kind, namespace), ListParams::default()).await
    }

    async fn delete_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete_ignoring_missing(&self.machines(kind, namespace), name).await
    }

    async fn list_machine_deployments(&self, kind: MachineKind, namespace: &str, node_group: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        let selector = format!("{}={}", CAPI_NODE_GROUP_LABEL, node_group);
        list_all(&self.machine_deployments(kind, namespace), ListParams::default().labels(&selector)).await
    }
}
