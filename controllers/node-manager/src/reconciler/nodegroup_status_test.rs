//! Unit tests for the NodeGroup status reconciler

#[cfg(test)]
mod tests {
    use crate::metrics::{machine_deployment_info, tracks_node_group};
    use crate::reconciler::conditions::{ERROR, FROZEN, READY, SCALING};
    use crate::reconciler::nodegroup_status::MACHINE_CREATION_FAILED;
    use crate::test_utils::*;
    use cluster_client::{MachineKind, MockClusterClient};
    use crds::{ConditionStatus, NodeGroupStatus, NodeType, find_condition};
    use kube::runtime::events::EventType;
    use kube_runtime::controller::Action;

    fn status(client: &MockClusterClient, name: &str) -> NodeGroupStatus {
        client.node_group(name).and_then(|ng| ng.status).expect("status written")
    }

    #[tokio::test]
    async fn test_cloud_ephemeral_healthy_group() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-healthy", 1, 5, &["a"]));
        mock.add_secret(checksum_secret(&[("ng-healthy", "abc")]));
        for name in ["n1", "n2"] {
            mock.add_node(node(name, "ng-healthy", NodeType::CloudEphemeral, true, Some("abc")));
            mock.add_machine(MachineKind::Capi, capi_machine(name, "ng-healthy", "Running", true));
        }
        mock.add_machine_deployment(MachineKind::Capi, machine_deployment(MachineKind::Capi, "md-healthy", "ng-healthy", 2, &[]));
        let (reconciler, client, events) = test_reconciler(mock);

        let action = reconciler.reconcile_node_group_status("ng-healthy").await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = status(&client, "ng-healthy");
        assert_eq!((status.nodes, status.ready, status.up_to_date), (2, 2, 2));
        assert_eq!((status.desired, status.min, status.max, status.instances), (2, 1, 5, 2));
        let is = |t: &str, s: ConditionStatus| find_condition(&status.conditions, t).map(|c| c.status) == Some(s);
        assert!(is(READY, ConditionStatus::True));
        assert!(is(SCALING, ConditionStatus::False));
        assert!(is(ERROR, ConditionStatus::False));
        assert!(is(FROZEN, ConditionStatus::False));
        assert_eq!(status.condition_summary.unwrap().ready, "True");
        assert_eq!(status.error, "");
        assert_eq!(status.last_machine_failures, Some(vec![]));
        assert!(events.events().is_empty());
        assert_eq!(machine_deployment_info("ng-healthy", "md-healthy"), 1.0);
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-idem", 1, 3, &["a"]));
        mock.add_secret(checksum_secret(&[("ng-idem", "abc")]));
        mock.add_node(node("n1", "ng-idem", NodeType::CloudEphemeral, true, Some("old")));
        mock.add_machine_deployment(
            MachineKind::Mcm,
            machine_deployment(MachineKind::Mcm, "md-idem", "ng-idem", 1, &[("m1", "2024-05-01T15:01:13Z", "quota exceeded")]),
        );
        let (reconciler, client, events) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-idem").await.unwrap();
        let writes = client.writes();
        assert_eq!(writes, 1);
        let first = status(&client, "ng-idem");

        reconciler.reconcile_node_group_status("ng-idem").await.unwrap();
        assert_eq!(client.writes(), writes);
        assert_eq!(status(&client, "ng-idem"), first);
        assert_eq!(events.reasons(), vec!["MachineFailed"]);
    }

    #[tokio::test]
    async fn test_preset_error_is_rewritten_and_reported() {
        let mut ng = cloud_node_group("ng-error", 2, 3, &["a", "b", "c"]);
        ng.status = Some(NodeGroupStatus {
            error: "Wrong classReference: D8TestInstanceClass".to_string(),
            ..Default::default()
        });
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        let (reconciler, client, events) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-error").await.unwrap();

        let status = status(&client, "ng-error");
        assert_eq!((status.min, status.max, status.desired, status.instances), (6, 9, 6, 0));
        let error = find_condition(&status.conditions, ERROR).unwrap();
        assert_eq!(error.status, ConditionStatus::True);
        assert!(error.message.starts_with("Wrong classReference"));
        assert_eq!(status.error, MACHINE_CREATION_FAILED);
        assert_eq!(status.condition_summary.unwrap().ready, "False");

        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].type_, EventType::Warning);
        assert_eq!(recorded[0].reason, "MachineFailed");
        assert_eq!(recorded[0].object, "ng-error");

        // The short form must not leak into the condition on the next pass.
        let writes = client.writes();
        reconciler.reconcile_node_group_status("ng-error").await.unwrap();
        assert_eq!(client.writes(), writes);
        assert_eq!(events.events().len(), 1);
    }

    #[tokio::test]
    async fn test_static_group_has_no_cloud_fields() {
        let mock = MockClusterClient::new();
        mock.add_node_group(node_group("ng-static", NodeType::Static));
        mock.add_node(node("s1", "ng-static", NodeType::Static, true, None));
        mock.add_node(node("s2", "ng-static", NodeType::Static, false, None));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-static").await.unwrap();

        let status = status(&client, "ng-static");
        assert_eq!((status.nodes, status.ready), (2, 1));
        assert_eq!((status.min, status.max, status.desired, status.instances), (0, 0, 0, 0));
        assert_eq!(status.last_machine_failures, None);
        let ready = find_condition(&status.conditions, READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "NotAllNodesReady");
        assert!(find_condition(&status.conditions, SCALING).is_none());
        assert!(find_condition(&status.conditions, FROZEN).is_none());
    }

    #[tokio::test]
    async fn test_machine_failures_sorted_by_time() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-failures", 0, 4, &["a"]));
        mock.add_machine_deployment(
            MachineKind::Capi,
            machine_deployment(MachineKind::Capi, "md-a", "ng-failures", 1, &[("m-a", "2024-05-01T15:01:15Z", "quota exceeded")]),
        );
        mock.add_machine_deployment(
            MachineKind::Capi,
            machine_deployment(MachineKind::Capi, "md-b", "ng-failures", 1, &[("m-b", "2024-05-01T15:01:13Z", "image not found")]),
        );
        let (reconciler, client, events) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-failures").await.unwrap();

        let status = status(&client, "ng-failures");
        let failures = status.last_machine_failures.unwrap();
        let names: Vec<&str> = failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["m-b", "m-a"]);
        assert_eq!(failures[1].provider_id, "cloud://m-a");
        assert_eq!(find_condition(&status.conditions, ERROR).unwrap().message, "quota exceeded");
        assert_eq!(status.desired, 2);
        assert_eq!(events.events()[0].note.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_zones_come_from_discovery_secret() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-zones", 1, 2, &[]));
        mock.add_secret(zones_secret(&["z1", "z2", "z3"]));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-zones").await.unwrap();

        let status = status(&client, "ng-zones");
        assert_eq!((status.min, status.max, status.desired), (3, 6, 3));
    }

    #[tokio::test]
    async fn test_frozen_deployment_sets_condition() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-frozen", 1, 1, &["a"]));
        mock.add_machine_deployment(
            MachineKind::Capi,
            frozen(machine_deployment(MachineKind::Capi, "md-frozen", "ng-frozen", 1, &[])),
        );
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-frozen").await.unwrap();

        let status = status(&client, "ng-frozen");
        assert!(find_condition(&status.conditions, FROZEN).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_malformed_deployment_reported_on_status() {
        let mut md = machine_deployment(MachineKind::Capi, "md-bad", "ng-bad", 1, &[]);
        md.data["spec"]["replicas"] = serde_json::json!("two");
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-bad", 1, 1, &["a"]));
        mock.add_machine_deployment(MachineKind::Capi, md);
        let (reconciler, client, _) = test_reconciler(mock);

        let action = reconciler.reconcile_node_group_status("ng-bad").await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = status(&client, "ng-bad");
        assert!(status.error.contains("spec.replicas is not an integer"));
        assert_eq!(status.condition_summary.unwrap().ready, "False");
    }

    #[tokio::test]
    async fn test_failure_operation_fields_are_mirrored() {
        let mut md = machine_deployment(MachineKind::Mcm, "md-op", "ng-op", 1, &[("m-op", "2024-05-01T15:01:13Z", "disk detach")]);
        md.data["status"]["failedMachines"][0]["lastOperation"]["state"] = "Processing".into();
        md.data["status"]["failedMachines"][0]["lastOperation"]["type"] = "Delete".into();
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-op", 0, 2, &["a"]));
        mock.add_machine_deployment(MachineKind::Mcm, md);
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_node_group_status("ng-op").await.unwrap();

        let failures = status(&client, "ng-op").last_machine_failures.unwrap();
        let op = failures[0].last_operation.clone().unwrap();
        assert_eq!(op.state, "Processing");
        assert_eq!(op.type_, "Delete");
        assert_eq!(op.description, "disk detach");
    }

    #[tokio::test]
    async fn test_deleted_group_releases_its_series() {
        let mock = MockClusterClient::new();
        mock.add_node_group(cloud_node_group("ng-deleted", 0, 2, &["a"]));
        mock.add_machine_deployment(
            MachineKind::Capi,
            machine_deployment(MachineKind::Capi, "md-deleted", "ng-deleted", 1, &[("m1", "2024-05-01T15:01:13Z", "quota exceeded")]),
        );
        let (reconciler, client, _) = test_reconciler(mock);
        reconciler.reconcile_node_group_status("ng-deleted").await.unwrap();
        assert_eq!(machine_deployment_info("ng-deleted", "md-deleted"), 1.0);
        assert!(!reconciler.remember_event("ng-deleted", "quota exceeded"));

        client.remove_node_group("ng-deleted");
        reconciler.reconcile_node_group_status("ng-deleted").await.unwrap();

        assert_eq!(machine_deployment_info("ng-deleted", "md-deleted"), 0.0);
        assert!(!tracks_node_group("ng-deleted"));
        assert!(reconciler.remember_event("ng-deleted", "quota exceeded"));
    }

    #[tokio::test]
    async fn test_missing_group_is_ignored() {
        let (reconciler, client, _) = test_reconciler(MockClusterClient::new());
        let action = reconciler.reconcile_node_group_status("absent").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(client.writes(), 0);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_error() {
        let mock = MockClusterClient::new();
        mock.add_node_group(node_group("ng-conflict", NodeType::Static));
        mock.inject_conflicts(1);
        let (reconciler, _, _) = test_reconciler(mock);

        let err = reconciler.reconcile_node_group_status("ng-conflict").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(reconciler.reconcile_node_group_status("ng-conflict").await.is_ok());
    }
}
