//! End-to-end workflow tests over the in-memory stack.

mod common;

use access_service::models::{AccessRequestStatus, ClientContext};
use access_service::services::{ApprovalDecision, CreateAccessRequest, ServiceError, SideEffect};
use common::TestApp;

fn ctx() -> ClientContext {
    ClientContext {
        ip_address: Some("198.51.100.4".to_string()),
        user_agent: Some("integration-test".to_string()),
        request_id: Some("req-test".to_string()),
    }
}

#[tokio::test]
async fn owner_approval_grants_role_and_binds_it_at_the_oracle() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role(&seed).await;
    let token = app.token(request.request_id, seed.owner.user_id);

    // Act
    let decision = app
        .workflow
        .coordinator
        .approve(request.request_id, seed.owner.user_id, &token, &ctx())
        .await
        .unwrap();

    // Assert
    let ApprovalDecision::Finalized(outcome) = decision else {
        panic!("single approval should finalize");
    };
    assert_eq!(outcome.request.status, AccessRequestStatus::Approved);
    assert_eq!(outcome.request.finalized_by, Some(seed.owner.user_id));
    assert!(outcome.request.finalized_utc.is_some());
    assert_eq!(outcome.oracle_sync, SideEffect::Succeeded);

    let assignment = outcome.assignment.expect("role request issues a grant");
    assert_eq!(assignment.user_id, seed.requester.user_id);
    assert_eq!(assignment.role_id, seed.role.role_id);
    assert!(assignment.oracle_synced);
    assert_eq!(app.store.assignment_count(), 1);

    let bindings = app.oracle.bindings_for(seed.requester.user_id);
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].role_key, "maintainer");
    assert!(
        app.workflow
            .assignments
            .check(seed.requester.user_id, "write", seed.repository.repository_id)
            .await
    );

    assert_eq!(
        app.actions_for(request.request_id).await,
        vec!["CREATED", "APPROVED"]
    );
}

#[tokio::test]
async fn quorum_finalizes_on_the_last_distinct_approval() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    assert_eq!(request.required_approvals(), 3);

    // Act
    let first = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.approvers[0].user_id,
            &app.token(request.request_id, seed.approvers[0].user_id),
            &ctx(),
        )
        .await
        .unwrap();
    let second = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.owner.user_id,
            &app.token(request.request_id, seed.owner.user_id),
            &ctx(),
        )
        .await
        .unwrap();

    // Assert
    assert!(matches!(
        first,
        ApprovalDecision::Recorded { approval_count: 1, required: 3, .. }
    ));
    assert!(matches!(
        second,
        ApprovalDecision::Recorded { approval_count: 2, required: 3, .. }
    ));
    assert_eq!(app.store.assignment_count(), 0);

    let last = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.approvers[1].user_id,
            &app.token(request.request_id, seed.approvers[1].user_id),
            &ctx(),
        )
        .await
        .unwrap();
    assert!(last.is_finalized());
    assert_eq!(last.request().approval_count, 3);
    assert_eq!(last.request().finalized_by, Some(seed.approvers[1].user_id));
    assert_eq!(app.store.assignment_count(), 1);

    assert_eq!(
        app.actions_for(request.request_id).await,
        vec![
            "CREATED",
            "APPROVAL_STEP",
            "APPROVAL_STEP",
            "APPROVAL_STEP",
            "APPROVED"
        ]
    );
}

#[tokio::test]
async fn repeat_approval_by_the_same_approver_is_a_conflict() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    let approver = seed.approvers[0].user_id;

    app.workflow
        .coordinator
        .approve(request.request_id, approver, &app.token(request.request_id, approver), &ctx())
        .await
        .unwrap();
    let err = app
        .workflow
        .coordinator
        .approve(request.request_id, approver, &app.token(request.request_id, approver), &ctx())
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Conflict(_)));
    let stored = app.workflow.registry.get(request.request_id).await.unwrap();
    assert_eq!(stored.approval_count, 1);
}

#[tokio::test]
async fn rejection_bypasses_the_quorum() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;
    let approver = seed.approvers[0].user_id;
    app.workflow
        .coordinator
        .approve(request.request_id, approver, &app.token(request.request_id, approver), &ctx())
        .await
        .unwrap();

    // Act
    let rejected = app
        .workflow
        .coordinator
        .reject(
            request.request_id,
            seed.approvers[1].user_id,
            Some("  not during the freeze  ".to_string()),
            &ctx(),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(rejected.status, AccessRequestStatus::Rejected);
    assert_eq!(rejected.finalized_by, Some(seed.approvers[1].user_id));
    assert_eq!(rejected.rejection_reason.as_deref(), Some("not during the freeze"));
    assert_eq!(rejected.approval_count, 1);
    assert_eq!(app.store.assignment_count(), 0);
    assert!(app.oracle.bindings_for(seed.requester.user_id).is_empty());

    let late = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.owner.user_id,
            &app.token(request.request_id, seed.owner.user_id),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(late, ServiceError::Conflict(_)));

    assert_eq!(
        app.actions_for(request.request_id).await,
        vec!["CREATED", "APPROVAL_STEP", "REJECTED"]
    );
}

#[tokio::test]
async fn terminal_requests_refuse_every_decision() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role(&seed).await;
    let owner = seed.owner.user_id;
    app.workflow
        .coordinator
        .approve(request.request_id, owner, &app.token(request.request_id, owner), &ctx())
        .await
        .unwrap();

    let again = app
        .workflow
        .coordinator
        .approve(request.request_id, owner, &app.token(request.request_id, owner), &ctx())
        .await
        .unwrap_err();
    let reject = app
        .workflow
        .coordinator
        .reject(request.request_id, owner, None, &ctx())
        .await
        .unwrap_err();

    assert!(matches!(again, ServiceError::Conflict(_)));
    assert!(matches!(reject, ServiceError::Conflict(_)));
    assert_eq!(app.store.assignment_count(), 1);
    assert_eq!(
        app.actions_for(request.request_id).await,
        vec!["CREATED", "APPROVED"]
    );
}

#[tokio::test]
async fn unauthorized_and_unverified_approvals_change_nothing() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role(&seed).await;

    let outsider = seed.outsider.user_id;
    let forbidden = app
        .workflow
        .coordinator
        .approve(request.request_id, outsider, &app.token(request.request_id, outsider), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(forbidden, ServiceError::Authorization(_)));

    // Token minted for a different request.
    let other = uuid::Uuid::new_v4();
    let wrong_token = app.token(other, seed.owner.user_id);
    let unverified = app
        .workflow
        .coordinator
        .approve(request.request_id, seed.owner.user_id, &wrong_token, &ctx())
        .await
        .unwrap_err();
    assert!(matches!(unverified, ServiceError::Verification(_)));

    let missing = app
        .workflow
        .coordinator
        .approve(uuid::Uuid::new_v4(), seed.owner.user_id, "x", &ctx())
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::NotFound(_)));

    let stored = app.workflow.registry.get(request.request_id).await.unwrap();
    assert!(stored.is_pending());
    assert_eq!(app.actions_for(request.request_id).await, vec!["CREATED"]);
}

#[tokio::test]
async fn actions_only_request_approves_without_a_grant() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app
        .workflow
        .registry
        .create(
            CreateAccessRequest {
                requester_id: seed.requester.user_id,
                repository_id: seed.repository.repository_id,
                actions: Some(vec!["read".to_string(), " read ".to_string(), "clone".to_string()]),
                reason: "audit export".to_string(),
                ..Default::default()
            },
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(request.requested_actions, vec!["read", "clone"]);

    let decision = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.owner.user_id,
            &app.token(request.request_id, seed.owner.user_id),
            &ctx(),
        )
        .await
        .unwrap();

    let ApprovalDecision::Finalized(outcome) = decision else {
        panic!("single approval should finalize");
    };
    assert!(outcome.assignment.is_none());
    assert_eq!(outcome.oracle_sync, SideEffect::Skipped);
    assert_eq!(app.store.assignment_count(), 0);
    assert_eq!(app.oracle.call_count("bind_role"), 0);
}

#[tokio::test]
async fn oracle_outage_keeps_the_local_grant_and_resync_recovers() {
    // Arrange
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role(&seed).await;
    app.oracle.set_available(false);

    // Act
    let decision = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.owner.user_id,
            &app.token(request.request_id, seed.owner.user_id),
            &ctx(),
        )
        .await
        .unwrap();

    // Assert
    let ApprovalDecision::Finalized(outcome) = decision else {
        panic!("single approval should finalize");
    };
    assert_eq!(outcome.request.status, AccessRequestStatus::Approved);
    assert!(outcome.oracle_sync.is_failed());
    let assignment = outcome.assignment.unwrap();
    assert!(!assignment.oracle_synced);
    assert_eq!(app.store.assignment_count(), 1);
    assert!(
        !app.workflow
            .assignments
            .check(seed.requester.user_id, "read", seed.repository.repository_id)
            .await
    );

    let failures = app
        .workflow
        .audit
        .history("role_assignment", &assignment.assignment_id.to_string())
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action, "ORACLE_SYNC_FAILED");
    let approved = app
        .workflow
        .audit
        .history("access_request", &request.request_id.to_string())
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(approved.action, "APPROVED");
    assert!(approved.sequence < failures[0].sequence);

    // A retry while still down fails again without losing the grant.
    let still_down = app.workflow.assignments.resync_pending().await.unwrap();
    assert_eq!((still_down.synced, still_down.failed), (0, 1));

    app.oracle.set_available(true);
    let report = app.workflow.assignments.resync_pending().await.unwrap();
    assert_eq!((report.synced, report.failed), (1, 0));
    assert_eq!(app.oracle.bindings_for(seed.requester.user_id).len(), 1);
    assert!(
        app.workflow
            .assignments
            .check(seed.requester.user_id, "read", seed.repository.repository_id)
            .await
    );

    let again = app.workflow.assignments.resync_pending().await.unwrap();
    assert_eq!((again.synced, again.failed), (0, 0));
}

#[tokio::test]
async fn transient_oracle_errors_are_retried() {
    let app = TestApp::with_retry(access_service::services::RetryPolicy::quick());
    let seed = app.seed().await;
    let request = app.request_role(&seed).await;
    app.oracle.fail_next(2);

    let decision = app
        .workflow
        .coordinator
        .approve(
            request.request_id,
            seed.owner.user_id,
            &app.token(request.request_id, seed.owner.user_id),
            &ctx(),
        )
        .await
        .unwrap();

    let ApprovalDecision::Finalized(outcome) = decision else {
        panic!("single approval should finalize");
    };
    assert_eq!(outcome.oracle_sync, SideEffect::Succeeded);
    assert_eq!(app.oracle.bindings_for(seed.requester.user_id).len(), 1);
}

#[tokio::test]
async fn notifications_reach_owner_approvers_and_requester() {
    let app = TestApp::new();
    let seed = app.seed().await;
    let request = app.request_role_with_quorum(&seed).await;

    assert_eq!(app.notifier.sent_to(seed.owner.user_id).await.len(), 1);
    for approver in &seed.approvers {
        assert_eq!(app.notifier.sent_to(approver.user_id).await.len(), 1);
    }
    assert!(app.notifier.sent_to(seed.requester.user_id).await.is_empty());

    let approver = seed.approvers[0].user_id;
    app.workflow
        .coordinator
        .approve(request.request_id, approver, &app.token(request.request_id, approver), &ctx())
        .await
        .unwrap();
    app.workflow
        .coordinator
        .reject(request.request_id, seed.owner.user_id, None, &ctx())
        .await
        .unwrap();

    let titles: Vec<String> = app
        .notifier
        .sent_to(seed.requester.user_id)
        .await
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(titles, vec!["Approval received", "Access rejected"]);
}

#[tokio::test]
async fn notifier_failures_never_fail_the_workflow() {
    use access_service::services::{
        AccessWorkflow, HmacBiometricVerifier, LocalOracle, MockNotifier, OracleClient,
        RetryPolicy,
    };
    use std::sync::Arc;

    let base = TestApp::new();
    let seed = base.seed().await;
    let verifier = Arc::new(HmacBiometricVerifier::new(
        common::BIOMETRIC_SECRET.as_bytes().to_vec(),
        chrono::Duration::minutes(5),
    ));
    let workflow = AccessWorkflow::new(
        base.store.clone(),
        OracleClient::new(Arc::new(LocalOracle::new()), RetryPolicy::none()),
        verifier.clone(),
        Arc::new(MockNotifier::new(false)),
    );

    let request = workflow
        .registry
        .create(
            CreateAccessRequest {
                requester_id: seed.requester.user_id,
                repository_id: seed.repository.repository_id,
                role_id: Some(seed.role.role_id),
                ..Default::default()
            },
            &ctx(),
        )
        .await
        .unwrap();
    let token = verifier.issue(request.request_id, seed.owner.user_id, chrono::Utc::now());
    let decision = workflow
        .coordinator
        .approve(request.request_id, seed.owner.user_id, &token, &ctx())
        .await
        .unwrap();

    assert!(decision.is_finalized());
}
