//! Unit tests for the update-approval reconciler

#[cfg(test)]
mod tests {
    use crate::metrics::node_status;
    use crate::test_utils::*;
    use cluster_client::{ClusterClient, MockClusterClient};
    use crds::well_known::{
        APPROVED_ANNOTATION, CONFIGURATION_CHECKSUM_ANNOTATION, DISRUPTION_APPROVED_ANNOTATION,
        DISRUPTION_REQUIRED_ANNOTATION, DRAINED_ANNOTATION, DRAINING_ANNOTATION, WAITING_FOR_APPROVAL_ANNOTATION,
    };
    use crds::{
        ApprovalMode, AutomaticDisruptions, DisruptionWindow, Disruptions, IntOrPercent, NodeGroup, NodeGroupStatus,
        NodeType, UpdatePolicy,
    };
    use serde_json::json;

    fn with_mode(mut ng: NodeGroup, mode: ApprovalMode, drain: Option<bool>) -> NodeGroup {
        ng.spec.disruptions = Some(Disruptions {
            approval_mode: mode,
            automatic: Some(AutomaticDisruptions {
                drain_before_approval: drain,
                windows: vec![],
            }),
            rolling_update: None,
        });
        ng
    }

    fn annotation(client: &MockClusterClient, node: &str, key: &str) -> Option<String> {
        client
            .node(node)
            .and_then(|n| n.metadata.annotations)
            .and_then(|a| a.get(key).cloned())
    }

    fn unschedulable(client: &MockClusterClient, node: &str) -> bool {
        client
            .node(node)
            .and_then(|n| n.spec)
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    fn approved(client: &MockClusterClient, nodes: &[&str]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| annotation(client, n, APPROVED_ANNOTATION).is_some())
            .map(|n| n.to_string())
            .collect()
    }

    async fn set_annotation(client: &MockClusterClient, node: &str, key: &str, value: &str) {
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        client.patch_node(node, &patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_mode_approves_one_at_a_time() {
        let mock = MockClusterClient::new();
        mock.add_node_group(with_mode(node_group("ng-manual", NodeType::Static), ApprovalMode::Manual, None));
        mock.add_secret(checksum_secret(&[("ng-manual", "new")]));
        for name in ["n1", "n2", "n3"] {
            let n = node(name, "ng-manual", NodeType::Static, true, Some("old"));
            mock.add_node(annotated(n, &[(DISRUPTION_REQUIRED_ANNOTATION, "")]));
        }
        let (reconciler, client, events) = test_reconciler(mock);
        let all = ["n1", "n2", "n3"];

        reconciler.reconcile_update_approval("ng-manual").await.unwrap();
        assert_eq!(approved(&client, &all), vec!["n1"]);
        assert_eq!(annotation(&client, "n1", DISRUPTION_APPROVED_ANNOTATION), None);

        reconciler.reconcile_update_approval("ng-manual").await.unwrap();
        assert_eq!(approved(&client, &all), vec!["n1"]);

        set_annotation(&client, "n1", CONFIGURATION_CHECKSUM_ANNOTATION, "new").await;
        reconciler.reconcile_update_approval("ng-manual").await.unwrap();

        assert_eq!(annotation(&client, "n1", DISRUPTION_REQUIRED_ANNOTATION), None);
        assert_eq!(approved(&client, &all), vec!["n2"]);
        assert_eq!(events.reasons(), vec!["NodeApproved", "NodeUpToDate", "NodeApproved"]);
        assert_eq!(node_status("ng-manual", "n3", "ToBeUpdated"), 1.0);
    }

    #[tokio::test]
    async fn test_manual_mode_ignores_nodes_without_disruption() {
        let mock = MockClusterClient::new();
        mock.add_node_group(with_mode(node_group("ng-manual-plain", NodeType::Static), ApprovalMode::Manual, None));
        mock.add_secret(checksum_secret(&[("ng-manual-plain", "new")]));
        mock.add_node(node("p1", "ng-manual-plain", NodeType::Static, true, Some("old")));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-manual-plain").await.unwrap();
        assert_eq!(client.writes(), 0);
    }

    #[tokio::test]
    async fn test_automatic_mode_drains_before_approval() {
        let mock = MockClusterClient::new();
        mock.add_node_group(node_group("ng-auto", NodeType::CloudPermanent));
        mock.add_secret(checksum_secret(&[("ng-auto", "new")]));
        let n = node("a1", "ng-auto", NodeType::CloudPermanent, true, Some("old"));
        mock.add_node(annotated(n, &[(WAITING_FOR_APPROVAL_ANNOTATION, "")]));
        let (reconciler, client, events) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-auto").await.unwrap();
        assert!(unschedulable(&client, "a1"));
        assert_eq!(annotation(&client, "a1", DRAINING_ANNOTATION).as_deref(), Some("bashible"));
        assert_eq!(annotation(&client, "a1", APPROVED_ANNOTATION), None);
        assert_eq!(events.reasons(), vec!["DrainingForDisruption"]);

        // Drain still running.
        let writes = client.writes();
        reconciler.reconcile_update_approval("ng-auto").await.unwrap();
        assert_eq!(client.writes(), writes);

        set_annotation(&client, "a1", DRAINED_ANNOTATION, "bashible").await;
        reconciler.reconcile_update_approval("ng-auto").await.unwrap();
        assert_eq!(annotation(&client, "a1", APPROVED_ANNOTATION).as_deref(), Some(""));
        assert_eq!(annotation(&client, "a1", WAITING_FOR_APPROVAL_ANNOTATION), None);

        set_annotation(&client, "a1", CONFIGURATION_CHECKSUM_ANNOTATION, "new").await;
        reconciler.reconcile_update_approval("ng-auto").await.unwrap();
        assert!(!unschedulable(&client, "a1"));
        assert_eq!(annotation(&client, "a1", APPROVED_ANNOTATION), None);
        assert_eq!(annotation(&client, "a1", DRAINING_ANNOTATION), None);
        assert_eq!(annotation(&client, "a1", DRAINED_ANNOTATION), None);
        assert_eq!(
            events.reasons(),
            vec!["DrainingForDisruption", "NodeApproved", "NodeUpToDate"]
        );
    }

    #[tokio::test]
    async fn test_single_master_is_never_cordoned() {
        let mut ng = node_group("master", NodeType::CloudPermanent);
        ng.status = Some(NodeGroupStatus {
            nodes: 1,
            ready: 1,
            ..Default::default()
        });
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("master", "new")]));
        let n = node("m1", "master", NodeType::CloudPermanent, true, Some("old"));
        mock.add_node(annotated(n, &[(DISRUPTION_REQUIRED_ANNOTATION, "")]));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_update_approval("master").await.unwrap();
        assert!(!unschedulable(&client, "m1"));
        assert_eq!(annotation(&client, "m1", APPROVED_ANNOTATION).as_deref(), Some(""));
        assert_eq!(annotation(&client, "m1", DISRUPTION_APPROVED_ANNOTATION).as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_controller_node_kept_schedulable_in_small_group() {
        let mut ng = node_group("ng-system", NodeType::Static);
        ng.status = Some(NodeGroupStatus {
            nodes: 2,
            ready: 1,
            ..Default::default()
        });
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("ng-system", "new")]));
        mock.add_node(node("sys1", "ng-system", NodeType::Static, true, Some("old")));
        let (reconciler, client, _) = test_reconciler_with(mock, Some("sys1"));

        reconciler.reconcile_update_approval("ng-system").await.unwrap();
        assert!(!unschedulable(&client, "sys1"));
        assert_eq!(approved(&client, &["sys1"]), vec!["sys1"]);
    }

    #[tokio::test]
    async fn test_percent_concurrency_without_drain() {
        let mut ng = with_mode(node_group("ng-pct", NodeType::Static), ApprovalMode::Automatic, Some(false));
        ng.spec.update = Some(UpdatePolicy {
            max_concurrent: Some(IntOrPercent::String("50%".to_string())),
        });
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("ng-pct", "new")]));
        for name in ["w1", "w2", "w3", "w4"] {
            mock.add_node(node(name, "ng-pct", NodeType::Static, true, Some("old")));
        }
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-pct").await.unwrap();
        assert_eq!(approved(&client, &["w1", "w2", "w3", "w4"]), vec!["w1", "w2"]);
        assert!(!unschedulable(&client, "w1"));
    }

    #[tokio::test]
    async fn test_rolling_update_skips_not_ready_nodes() {
        let ng = with_mode(node_group("ng-rolling", NodeType::Static), ApprovalMode::RollingUpdate, None);
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("ng-rolling", "new")]));
        mock.add_node(node("r1", "ng-rolling", NodeType::Static, false, Some("old")));
        mock.add_node(node("r2", "ng-rolling", NodeType::Static, true, Some("old")));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-rolling").await.unwrap();
        assert_eq!(approved(&client, &["r1", "r2"]), vec!["r2"]);
        assert!(!unschedulable(&client, "r2"));
    }

    #[tokio::test]
    async fn test_closed_window_blocks_approval() {
        let mut ng = with_mode(node_group("ng-window", NodeType::Static), ApprovalMode::Automatic, Some(false));
        if let Some(automatic) = ng.spec.disruptions.as_mut().and_then(|d| d.automatic.as_mut()) {
            automatic.windows = vec![DisruptionWindow {
                from: "00:00".to_string(),
                to: "00:00".to_string(),
                days: vec![],
            }];
        }
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("ng-window", "new")]));
        mock.add_node(node("x1", "ng-window", NodeType::Static, true, Some("old")));
        let (reconciler, client, _) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-window").await.unwrap();
        assert_eq!(client.writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_checksum_secret_skips() {
        let mock = MockClusterClient::new();
        mock.add_node_group(node_group("ng-nosecret", NodeType::Static));
        mock.add_node(node("y1", "ng-nosecret", NodeType::Static, true, Some("old")));
        let (reconciler, client, events) = test_reconciler(mock);

        reconciler.reconcile_update_approval("ng-nosecret").await.unwrap();
        assert_eq!(client.writes(), 0);
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_on_approval_surfaces() {
        let ng = with_mode(node_group("ng-cas", NodeType::Static), ApprovalMode::Automatic, Some(false));
        let mock = MockClusterClient::new();
        mock.add_node_group(ng);
        mock.add_secret(checksum_secret(&[("ng-cas", "new")]));
        mock.add_node(node("c1", "ng-cas", NodeType::Static, true, Some("old")));
        mock.inject_conflicts(1);
        let (reconciler, client, _) = test_reconciler(mock);

        let err = reconciler.reconcile_update_approval("ng-cas").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(approved(&client, &["c1"]).is_empty());

        reconciler.reconcile_update_approval("ng-cas").await.unwrap();
        assert_eq!(approved(&client, &["c1"]), vec!["c1"]);
    }
}
