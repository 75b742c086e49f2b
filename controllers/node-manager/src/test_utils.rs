//! Test utilities for unit testing reconcilers
//!
//! Fixtures for NodeGroups, Nodes, Secrets and untyped Machines and
//! MachineDeployments, plus a reconciler wired to the in-memory client.

use crate::events::RecordingEventPublisher;
use crate::reconciler::{Reconciler, Settings};
use cluster_client::{MachineKind, MockClusterClient};
use crds::well_known::{
    CAPI_NODE_GROUP_LABEL, CLOUD_PROVIDER_SECRET, CLOUD_PROVIDER_SECRET_NAMESPACE, CONFIGURATION_CHECKSUM_ANNOTATION,
    CONFIGURATION_CHECKSUMS_SECRET, DEFAULT_MACHINE_NAMESPACE, NODE_GROUP_LABEL, NODE_TYPE_LABEL,
};
use crds::{CloudInstances, NodeGroup, NodeGroupSpec, NodeType};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Namespace the fixtures put Machines and the checksum Secret in.
pub const TEST_NAMESPACE: &str = DEFAULT_MACHINE_NAMESPACE;

/// Reconciler over `client`, returned together with the client and the event sink.
pub fn test_reconciler(client: MockClusterClient) -> (Reconciler, MockClusterClient, Arc<RecordingEventPublisher>) {
    test_reconciler_with(client, None)
}

/// Like [`test_reconciler`], with the platform controller running on `controller_node`.
pub fn test_reconciler_with(
    client: MockClusterClient,
    controller_node: Option<&str>,
) -> (Reconciler, MockClusterClient, Arc<RecordingEventPublisher>) {
    let events = Arc::new(RecordingEventPublisher::default());
    let settings = Settings {
        machine_namespace: TEST_NAMESPACE.to_string(),
        controller_node_name: controller_node.map(str::to_string),
    };
    let reconciler = Reconciler::new(Arc::new(client.clone()), events.clone(), settings);
    (reconciler, client, events)
}

pub fn node_group(name: &str, node_type: NodeType) -> NodeGroup {
    NodeGroup::new(
        name,
        NodeGroupSpec {
            node_type,
            ..Default::default()
        },
    )
}

/// CloudEphemeral group with explicit zones; empty `zones` defers to discovery.
pub fn cloud_node_group(name: &str, min_per_zone: i32, max_per_zone: i32, zones: &[&str]) -> NodeGroup {
    let mut ng = node_group(name, NodeType::CloudEphemeral);
    ng.spec.cloud_instances = Some(CloudInstances {
        min_per_zone,
        max_per_zone,
        zones: zones.iter().map(|z| z.to_string()).collect(),
        ..Default::default()
    });
    ng
}

/// Node labelled for `group`, optionally Ready and carrying a checksum.
pub fn node(name: &str, group: &str, node_type: NodeType, ready: bool, checksum: Option<&str>) -> Node {
    let labels = BTreeMap::from([
        (NODE_GROUP_LABEL.to_string(), group.to_string()),
        (NODE_TYPE_LABEL.to_string(), node_type.as_str().to_string()),
    ]);
    let annotations = checksum
        .map(|c| BTreeMap::from([(CONFIGURATION_CHECKSUM_ANNOTATION.to_string(), c.to_string())]))
        .unwrap_or_default();
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Adds annotations to a node fixture.
pub fn annotated(mut node: Node, annotations: &[(&str, &str)]) -> Node {
    let map = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in annotations {
        map.insert(k.to_string(), v.to_string());
    }
    node
}

fn secret(namespace: &str, name: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// `configuration-checksums` Secret mapping NodeGroup names to checksums.
pub fn checksum_secret(checksums: &[(&str, &str)]) -> Secret {
    let data = checksums
        .iter()
        .map(|(ng, sum)| (ng.to_string(), ByteString(sum.as_bytes().to_vec())))
        .collect();
    secret(TEST_NAMESPACE, CONFIGURATION_CHECKSUMS_SECRET, data)
}

/// Cloud provider discovery Secret listing `zones`.
pub fn zones_secret(zones: &[&str]) -> Secret {
    let raw = serde_json::to_vec(zones).unwrap();
    let data = BTreeMap::from([("zones".to_string(), ByteString(raw))]);
    secret(CLOUD_PROVIDER_SECRET_NAMESPACE, CLOUD_PROVIDER_SECRET, data)
}

fn untyped(kind: MachineKind, deployment: bool, name: &str, labels: BTreeMap<String, String>, data: Value) -> DynamicObject {
    let resource = if deployment {
        kind.deployment_resource()
    } else {
        kind.machine_resource()
    };
    let mut obj = DynamicObject::new(name, &resource).within(TEST_NAMESPACE).data(data);
    obj.metadata.labels = Some(labels);
    obj
}

/// Cluster-lifecycle Machine of `group`, Ready when `ready`.
pub fn capi_machine(name: &str, group: &str, phase: &str, ready: bool) -> DynamicObject {
    let labels = BTreeMap::from([(CAPI_NODE_GROUP_LABEL.to_string(), group.to_string())]);
    let data = json!({
        "spec": {},
        "status": {
            "phase": phase,
            "nodeRef": { "name": name },
            "conditions": [{
                "type": "Ready",
                "status": if ready { "True" } else { "False" },
                "reason": if ready { "" } else { "WaitingForBootstrap" },
                "message": if ready { "" } else { "waiting for bootstrap data" },
                "lastTransitionTime": "2024-05-01T10:00:00Z",
            }],
        },
    });
    untyped(MachineKind::Capi, false, name, labels, data)
}

/// Legacy Machine of `group`.
pub fn mcm_machine(name: &str, group: &str, phase: &str) -> DynamicObject {
    let data = json!({
        "spec": { "nodeTemplate": { "metadata": { "labels": { NODE_GROUP_LABEL: group } } } },
        "status": { "node": name, "currentStatus": { "phase": phase } },
    });
    untyped(MachineKind::Mcm, false, name, BTreeMap::new(), data)
}

/// MachineDeployment of `group` with `replicas` and failed machines `(name, lastUpdateTime, description)`.
pub fn machine_deployment(
    kind: MachineKind,
    name: &str,
    group: &str,
    replicas: i64,
    failed: &[(&str, &str, &str)],
) -> DynamicObject {
    let labels = BTreeMap::from([(CAPI_NODE_GROUP_LABEL.to_string(), group.to_string())]);
    let failed: Vec<Value> = failed
        .iter()
        .map(|(machine, time, description)| {
            json!({
                "name": machine,
                "providerID": format!("cloud://{machine}"),
                "ownerRef": name,
                "lastOperation": {
                    "description": description,
                    "lastUpdateTime": time,
                    "state": "Failed",
                    "type": "Create",
                },
            })
        })
        .collect();
    let data = json!({
        "spec": { "replicas": replicas },
        "status": { "failedMachines": failed },
    });
    untyped(kind, true, name, labels, data)
}

/// Marks a MachineDeployment fixture `Frozen=True`.
pub fn frozen(mut md: DynamicObject) -> DynamicObject {
    md.data["status"]["conditions"] = json!([{ "type": "Frozen", "status": "True" }]);
    md
}
