//! Unit tests for the machine adapter

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::machine::{LEGACY_PLACEHOLDER_MESSAGE, Machine, MachineState, short_description};
    use crate::test_utils::{capi_machine, mcm_machine};
    use chrono::{TimeZone, Utc};
    use cluster_client::MachineKind;
    use crds::{ConditionStatus, InstancePhase, MachineStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;
    use serde_json::json;

    fn with_conditions(mut obj: DynamicObject, phase: &str, conditions: serde_json::Value) -> DynamicObject {
        obj.data["status"]["phase"] = json!(phase);
        obj.data["status"]["conditions"] = conditions;
        obj
    }

    #[test]
    fn test_capi_ready_machine() {
        let machine = Machine::from_object(&capi_machine("m1", "ng", "Running", true)).unwrap();
        assert_eq!(machine.kind, MachineKind::Capi);
        assert_eq!(machine.node_group.as_deref(), Some("ng"));
        assert_eq!(machine.node_name.as_deref(), Some("m1"));
        assert!(!machine.is_legacy());
        assert_eq!(machine.state(), MachineState::Ready);

        let status = machine.status(false);
        assert_eq!(status.phase, InstancePhase::Running);
        assert_eq!(status.machine_status, MachineStatus::Ready);
        let condition = status.condition.unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "Ready");
        assert_eq!(
            condition.last_transition_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
        assert!(status.last_operation.is_none());
    }

    #[test]
    fn test_infrastructure_wait_and_problem() {
        let waiting = with_conditions(
            capi_machine("m1", "ng", "Running", false),
            "Provisioning",
            json!([{ "type": "InfrastructureReady", "status": "False", "severity": "Warning", "message": "creating VM" }]),
        );
        let machine = Machine::from_object(&waiting).unwrap();
        assert_eq!(machine.state(), MachineState::InfraWait);
        assert_eq!(machine.status(false).machine_status, MachineStatus::Progressing);
        assert_eq!(machine.status(false).message, "creating VM");

        let failed = with_conditions(
            capi_machine("m1", "ng", "Running", false),
            "Provisioning",
            json!([{ "type": "InfrastructureReady", "status": "False", "severity": "Error", "message": "quota" }]),
        );
        let machine = Machine::from_object(&failed).unwrap();
        assert_eq!(machine.state(), MachineState::InfraProblem);
        assert_eq!(machine.status(false).machine_status, MachineStatus::Error);
    }

    #[test]
    fn test_drain_blocked_deletion() {
        let mut obj = with_conditions(
            capi_machine("m1", "ng", "Running", false),
            "Deleting",
            json!([{ "type": "Deleting", "status": "True", "reason": "DrainingFailed", "message": "pdb violation" }]),
        );
        obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let machine = Machine::from_object(&obj).unwrap();
        assert!(machine.deleting);
        assert_eq!(machine.state(), MachineState::Blocked);
        let status = machine.status(false);
        assert_eq!(status.machine_status, MachineStatus::Blocked);
        assert_eq!(status.phase, InstancePhase::Draining);
        let op = status.last_operation.unwrap();
        assert_eq!(op.description, "pdb violation");
        assert_eq!(op.type_, "Delete");
        assert_eq!(op.state, "Processing");
    }

    #[test]
    fn test_deleting_without_drain_is_terminating() {
        let mut obj = capi_machine("m1", "ng", "Running", true);
        obj.data["status"]["conditions"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "type": "DrainingSucceeded", "status": "True", "lastTransitionTime": "2024-05-01T11:00:00Z" }));
        let machine = Machine::from_object(&obj).unwrap();
        assert_eq!(machine.status(false).phase, InstancePhase::Running);

        let status = machine.status(true);
        assert_eq!(status.phase, InstancePhase::Terminating);
        assert!(status.phase_time.is_none());
    }

    #[test]
    fn test_drain_detected_from_condition_and_start_time() {
        let obj = with_conditions(
            capi_machine("m1", "ng", "Running", true),
            "Running",
            json!([{ "type": "DrainingSucceeded", "status": "False", "lastTransitionTime": "2024-05-01T11:00:00Z" }]),
        );
        let status = Machine::from_object(&obj).unwrap().status(true);
        assert_eq!(status.phase, InstancePhase::Draining);
        assert_eq!(status.phase_time, Some(Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()));

        let mut obj = capi_machine("m1", "ng", "Deleting", true);
        obj.data["status"]["deletion"] = json!({ "nodeDrainStartTime": "2024-05-01T12:00:00Z" });
        let machine = Machine::from_object(&obj).unwrap();
        let status = machine.status(false);
        assert_eq!(status.phase, InstancePhase::Draining);
        assert_eq!(status.phase_time, Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_drain_start_ignored_until_deletion() {
        let mut obj = capi_machine("m1", "ng", "Running", true);
        obj.data["status"]["deletion"] = json!({ "nodeDrainStartTime": "2024-05-01T12:00:00Z" });
        let status = Machine::from_object(&obj).unwrap().status(false);
        assert_eq!(status.phase, InstancePhase::Running);
    }

    #[test]
    fn test_error_condition_fails_the_instance() {
        let obj = with_conditions(
            capi_machine("m1", "ng", "Running", false),
            "Provisioned",
            json!([
                { "type": "Ready", "status": "False", "severity": "Error", "reason": "NotReady", "message": "node not ready" },
                {
                    "type": "BootstrapReady",
                    "status": "False",
                    "severity": "Error",
                    "reason": "BootstrapFailed",
                    "message": "cloud-init failed",
                    "lastTransitionTime": "2024-05-01T09:30:00Z",
                },
            ]),
        );
        let status = Machine::from_object(&obj).unwrap().status(false);
        assert_eq!(status.phase, InstancePhase::Failed);
        assert_eq!(status.phase_time, Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()));
        let op = status.last_operation.unwrap();
        assert_eq!(op.description, "BootstrapReady: BootstrapFailed: cloud-init failed");
        assert_eq!(op.state, "Failed");
        assert_eq!(op.type_, "HealthCheck");
    }

    #[test]
    fn test_failure_fields_fail_the_instance() {
        let mut obj = capi_machine("m1", "ng", "Provisioning", false);
        obj.data["status"]["failureReason"] = json!("CreateError");
        obj.data["status"]["failureMessage"] = json!("quota exceeded");
        obj.data["status"]["lastUpdated"] = json!("2024-05-02T08:00:00Z");
        let status = Machine::from_object(&obj).unwrap().status(false);
        assert_eq!(status.phase, InstancePhase::Failed);
        assert_eq!(status.phase_time, Some(Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap()));
        assert_eq!(status.last_operation.unwrap().description, "CreateError: quota exceeded");
    }

    #[test]
    fn test_most_relevant_message_wins() {
        let obj = with_conditions(
            capi_machine("m1", "ng", "Provisioning", false),
            "Provisioning",
            json!([
                { "type": "Ready", "status": "False", "message": "waiting for node" },
                { "type": "InfrastructureReady", "status": "True", "message": "vm created" },
            ]),
        );
        let op = Machine::from_object(&obj).unwrap().status(false).last_operation.unwrap();
        assert_eq!(op.description, "vm created");
        assert_eq!(op.state, "Processing");
        assert_eq!(op.type_, "HealthCheck");
    }

    #[test]
    fn test_plain_deletion_is_progressing() {
        let obj = with_conditions(
            capi_machine("m1", "ng", "Running", false),
            "Deleting",
            json!([{ "type": "Deleting", "status": "True", "reason": "WaitingForPreDrainHook" }]),
        );
        let machine = Machine::from_object(&obj).unwrap();
        assert_eq!(machine.state(), MachineState::Deleting);
        assert_eq!(machine.status(false).machine_status, MachineStatus::Progressing);
    }

    #[test]
    fn test_legacy_machine() {
        let machine = Machine::from_object(&mcm_machine("l1", "ng-legacy", "Running")).unwrap();
        assert!(machine.is_legacy());
        assert_eq!(machine.node_group.as_deref(), Some("ng-legacy"));
        assert_eq!(machine.node_name.as_deref(), Some("l1"));
        let status = machine.status(false);
        assert_eq!(status.phase, InstancePhase::Running);
        assert_eq!(status.machine_status, MachineStatus::Progressing);
        assert_eq!(status.message, LEGACY_PLACEHOLDER_MESSAGE);
        assert!(status.condition.is_none());
        assert!(status.last_operation.is_none());
        assert_eq!(machine.machine_ref().api_version, MachineKind::Mcm.api_version());
    }

    #[test]
    fn test_legacy_operation_is_mirrored() {
        let mut obj = mcm_machine("l1", "ng-legacy", "CrashLoopBackOff");
        obj.data["status"]["currentStatus"]["lastUpdateTime"] = json!("2024-05-03T10:00:00Z");
        obj.data["status"]["lastOperation"] = json!({
            "description": "Cloud provider message - machine codes error",
            "lastUpdateTime": "2024-05-03T09:59:00Z",
            "state": "Failed",
            "type": "Create",
        });
        let status = Machine::from_object(&obj).unwrap().status(false);
        assert_eq!(status.phase, InstancePhase::CrashLoopBackOff);
        assert_eq!(status.phase_time, Some(Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap()));
        let op = status.last_operation.unwrap();
        assert_eq!(op.state, "Failed");
        assert_eq!(op.type_, "Create");
        assert_eq!(op.last_update_time, Some(Utc.with_ymd_and_hms(2024, 5, 3, 9, 59, 0).unwrap()));
    }

    #[test]
    fn test_short_description() {
        assert_eq!(short_description("disk full: "), "disk full");
        assert_eq!(short_description("retrying -"), "retrying ");
        let long = "x".repeat(250);
        let short = short_description(&long);
        assert_eq!(short.chars().count(), 200);
        assert!(short.ends_with("..."));
        assert_eq!(short_description(""), "");
    }

    #[test]
    fn test_unknown_api_version_rejected() {
        let mut obj = capi_machine("m1", "ng", "Running", true);
        if let Some(types) = obj.types.as_mut() {
            types.api_version = "example.com/v1".to_string();
        }
        assert!(matches!(
            Machine::from_object(&obj),
            Err(ControllerError::UnsupportedMachineKind(_))
        ));
    }

    #[test]
    fn test_wrong_field_type_is_invalid() {
        let mut obj = capi_machine("m1", "ng", "Running", true);
        obj.data["status"]["phase"] = json!(42);
        let err = Machine::from_object(&obj).unwrap_err();
        assert!(err.is_invalid_object());
        assert!(err.to_string().contains("status.phase"));
    }
}
