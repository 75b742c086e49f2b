//! Mock ClusterClient for unit testing
//!
//! An in-memory object store with the write semantics reconcilers depend on:
//! JSON merge patches, resourceVersion bumps on every write, compare-and-swap
//! when a patch carries `metadata.resourceVersion`, and finalizer-aware
//! deletion. Every successful write is counted so tests can assert that a
//! reconcile was a no-op.

mod merge;

pub use merge::merge_patch;

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crate::machine_kind::MachineKind;
use crds::well_known::{CAPI_NODE_GROUP_LABEL, NODE_GROUP_LABEL};
use chrono::{SecondsFormat, Utc};
use crds::{Instance, NodeGroup};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::DynamicObject;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Resource {
    NodeGroup,
    Node,
    Secret,
    Instance,
    Machine(MachineKind),
    MachineDeployment(MachineKind),
}

type Key = (Resource, String, String);

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    objects: Arc<Mutex<BTreeMap<Key, Value>>>,
    resource_version: Arc<Mutex<u64>>,
    writes: Arc<Mutex<usize>>,
    pending_conflicts: Arc<Mutex<usize>>,
}

fn key(resource: Resource, namespace: &str, name: &str) -> Key {
    (resource, namespace.to_string(), name.to_string())
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, ClusterError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn label<'a>(value: &'a Value, label: &str) -> Option<&'a str> {
    value.pointer("/metadata/labels").and_then(|l| l.get(label)).and_then(Value::as_str)
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        let mut rv = self.resource_version.lock().unwrap();
        *rv += 1;
        rv.to_string()
    }

    fn store<T: Serialize>(&self, resource: Resource, namespace: &str, name: &str, object: &T) {
        let mut value = serde_json::to_value(object).unwrap();
        value["metadata"]["resourceVersion"] = json!(self.next_resource_version());
        self.objects.lock().unwrap().insert(key(resource, namespace, name), value);
    }

    fn load<T: DeserializeOwned>(&self, resource: Resource, namespace: &str, name: &str) -> Result<Option<T>, ClusterError> {
        let objects = self.objects.lock().unwrap();
        objects.get(&key(resource, namespace, name)).map(decode).transpose()
    }

    fn list<T: DeserializeOwned>(&self, filter: impl Fn(&Key, &Value) -> bool) -> Result<Vec<T>, ClusterError> {
        let objects = self.objects.lock().unwrap();
        objects.iter().filter(|(k, v)| filter(k, v)).map(|(_, v)| decode(v)).collect()
    }

    fn begin_write(&self) -> Result<(), ClusterError> {
        let mut pending = self.pending_conflicts.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return Err(ClusterError::Conflict("injected conflict".to_string()));
        }
        Ok(())
    }

    fn finish_write(&self) {
        *self.writes.lock().unwrap() += 1;
    }

    /// Merge-patches a stored object, honouring `metadata.resourceVersion` as a precondition.
    fn apply_patch(&self, resource: Resource, namespace: &str, name: &str, patch: &Value) -> Result<Value, ClusterError> {
        self.begin_write()?;
        let rv = self.next_resource_version();
        let mut objects = self.objects.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(current) = objects.get_mut(&k) else {
            return Err(ClusterError::NotFound(name.to_string()));
        };

        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            let actual = current.pointer("/metadata/resourceVersion").and_then(Value::as_str).unwrap_or_default();
            if expected != actual {
                return Err(ClusterError::Conflict(format!(
                    "{name}: resourceVersion {expected} is stale, current is {actual}"
                )));
            }
        }

        merge_patch(current, patch);
        current["metadata"]["resourceVersion"] = json!(rv);
        let updated = current.clone();

        let deleting = updated.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null());
        let finalizers_empty = updated
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_none_or(Vec::is_empty);
        if deleting && finalizers_empty {
            objects.remove(&k);
        }
        drop(objects);
        self.finish_write();
        Ok(updated)
    }

    /// Deletes an object, or marks it deleting while finalizers remain.
    fn apply_delete(&self, resource: Resource, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.begin_write()?;
        let rv = self.next_resource_version();
        let mut objects = self.objects.lock().unwrap();
        let k = key(resource, namespace, name);
        let Some(current) = objects.get_mut(&k) else {
            return Ok(());
        };

        let has_finalizers = current
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if current.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null()) {
                return Ok(());
            }
            current["metadata"]["deletionTimestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            current["metadata"]["resourceVersion"] = json!(rv);
        } else {
            objects.remove(&k);
        }
        drop(objects);
        self.finish_write();
        Ok(())
    }

    // Test setup

    /// Add a NodeGroup to the mock store (for test setup)
    pub fn add_node_group(&self, node_group: NodeGroup) {
        let name = node_group.metadata.name.clone().unwrap_or_default();
        self.store(Resource::NodeGroup, "", &name, &node_group);
    }

    /// Add a Node to the mock store (for test setup)
    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.store(Resource::Node, "", &name, &node);
    }

    /// Add a Secret to the mock store (for test setup)
    pub fn add_secret(&self, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        self.store(Resource::Secret, &namespace, &name, &secret);
    }

    /// Add an Instance to the mock store (for test setup)
    pub fn add_instance(&self, instance: Instance) {
        let name = instance.metadata.name.clone().unwrap_or_default();
        self.store(Resource::Instance, "", &name, &instance);
    }

    /// Add a Machine to the mock store (for test setup)
    pub fn add_machine(&self, kind: MachineKind, machine: DynamicObject) {
        let name = machine.metadata.name.clone().unwrap_or_default();
        let namespace = machine.metadata.namespace.clone().unwrap_or_default();
        self.store(Resource::Machine(kind), &namespace, &name, &machine);
    }

    /// Add a MachineDeployment to the mock store (for test setup)
    pub fn add_machine_deployment(&self, kind: MachineKind, deployment: DynamicObject) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        self.store(Resource::MachineDeployment(kind), &namespace, &name, &deployment);
    }

    /// Remove a NodeGroup outright (for test setup)
    pub fn remove_node_group(&self, name: &str) {
        self.objects.lock().unwrap().remove(&key(Resource::NodeGroup, "", name));
    }

    /// Remove a Node outright, bypassing finalizers (for test setup)
    pub fn remove_node(&self, name: &str) {
        self.objects.lock().unwrap().remove(&key(Resource::Node, "", name));
    }

    /// Remove a Machine outright, bypassing finalizers (for test setup)
    pub fn remove_machine(&self, kind: MachineKind, namespace: &str, name: &str) {
        self.objects.lock().unwrap().remove(&key(Resource::Machine(kind), namespace, name));
    }

    /// Make the next `count` writes fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        *self.pending_conflicts.lock().unwrap() = count;
    }

    // Test inspection

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    /// Stored NodeGroup (for assertions)
    pub fn node_group(&self, name: &str) -> Option<NodeGroup> {
        self.load(Resource::NodeGroup, "", name).unwrap()
    }

    /// Stored Node (for assertions)
    pub fn node(&self, name: &str) -> Option<Node> {
        self.load(Resource::Node, "", name).unwrap()
    }

    /// Stored Instance (for assertions)
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.load(Resource::Instance, "", name).unwrap()
    }

    /// Stored Machine (for assertions)
    pub fn machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.load(Resource::Machine(kind), namespace, name).unwrap()
    }

    /// Names of all stored Instances
    pub fn instance_names(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(r, _, _)| *r == Resource::Instance)
            .map(|(_, _, name)| name.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_node_group(&self, name: &str) -> Result<Option<NodeGroup>, ClusterError> {
        self.load(Resource::NodeGroup, "", name)
    }

    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>, ClusterError> {
        self.list(|(r, _, _), _| *r == Resource::NodeGroup)
    }

    async fn patch_node_group_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        self.apply_patch(Resource::NodeGroup, "", name, patch).map(|_| ())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, ClusterError> {
        self.load(Resource::Node, "", name)
    }

    async fn list_nodes_in_group(&self, node_group: &str) -> Result<Vec<Node>, ClusterError> {
        self.list(|(r, _, _), v| *r == Resource::Node && label(v, NODE_GROUP_LABEL) == Some(node_group))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        self.apply_patch(Resource::Node, "", name, patch).map(|_| ())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        self.load(Resource::Secret, namespace, name)
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ClusterError> {
        self.load(Resource::Instance, "", name)
    }

    async fn create_instance(&self, instance: &Instance) -> Result<Instance, ClusterError> {
        let name = instance
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject("Instance without a name".to_string()))?;
        self.begin_write()?;
        if self.objects.lock().unwrap().contains_key(&key(Resource::Instance, "", &name)) {
            return Err(ClusterError::AlreadyExists(name));
        }
        self.store(Resource::Instance, "", &name, instance);
        self.finish_write();
        self.load(Resource::Instance, "", &name)?
            .ok_or(ClusterError::NotFound(name))
    }

    async fn patch_instance(&self, name: &str, patch: &Value) -> Result<Instance, ClusterError> {
        let updated = self.apply_patch(Resource::Instance, "", name, patch)?;
        decode(&updated)
    }

    async fn patch_instance_status(&self, name: &str, patch: &Value) -> Result<(), ClusterError> {
        self.apply_patch(Resource::Instance, "", name, patch).map(|_| ())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ClusterError> {
        self.apply_delete(Resource::Instance, "", name)
    }

    async fn get_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        self.load(Resource::Machine(kind), namespace, name)
    }

    async fn list_machines(&self, kind: MachineKind, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        let resource = Resource::Machine(kind);
        self.list(|(r, ns, _), _| *r == resource && ns == namespace)
    }

    async fn delete_machine(&self, kind: MachineKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.apply_delete(Resource::Machine(kind), namespace, name)
    }

    async fn list_machine_deployments(&self, kind: MachineKind, namespace: &str, node_group: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        let resource = Resource::MachineDeployment(kind);
        self.list(|(r, ns, _), v| *r == resource && ns == namespace && label(v, CAPI_NODE_GROUP_LABEL) == Some(node_group))
    }
}
