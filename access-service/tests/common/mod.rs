//! Shared fixture for access-service integration tests.
//!
//! Wires every component over the in-memory store, the in-process oracle,
//! the HMAC biometric verifier and a recording notifier.

#![allow(dead_code)]

use access_service::{
    build_router,
    models::{AccessRequest, ClientContext, Organization, Repository, Role, User},
    services::{
        AccessStore, AccessWorkflow, CreateAccessRequest, HmacBiometricVerifier, LocalOracle,
        MemoryStore, MockNotifier, OracleClient, RetryPolicy,
    },
    AppState, ServiceInfo,
};
use axum::Router;
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const BIOMETRIC_SECRET: &str = "integration-test-biometric-secret";

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub oracle: Arc<LocalOracle>,
    pub verifier: Arc<HmacBiometricVerifier>,
    pub notifier: Arc<MockNotifier>,
    pub workflow: AccessWorkflow,
    pub state: AppState,
}

/// One organization with an owned repository, a role and a few users.
pub struct Seed {
    pub org: Organization,
    pub owner: User,
    pub requester: User,
    pub approvers: Vec<User>,
    /// Enrolled user with no relation to the repository.
    pub outsider: User,
    pub repository: Repository,
    pub role: Role,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_retry(RetryPolicy::none())
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let oracle = Arc::new(LocalOracle::new());
        let verifier = Arc::new(HmacBiometricVerifier::new(
            BIOMETRIC_SECRET.as_bytes().to_vec(),
            Duration::minutes(5),
        ));
        let notifier = Arc::new(MockNotifier::new(true));

        let workflow = AccessWorkflow::new(
            store.clone(),
            OracleClient::new(oracle.clone(), retry),
            verifier.clone(),
            notifier.clone(),
        );
        let state = AppState {
            service: ServiceInfo {
                name: "access-service-test".to_string(),
                version: "0.0.0".to_string(),
                environment: "Dev".to_string(),
            },
            workflow: workflow.clone(),
        };

        Self {
            store,
            oracle,
            verifier,
            notifier,
            workflow,
            state,
        }
    }

    /// A second workflow over `store`, sharing this app's oracle, verifier
    /// and notifier. Used to put a failing store in front of the seeded one.
    pub fn workflow_over(&self, store: Arc<dyn AccessStore>) -> AccessWorkflow {
        AccessWorkflow::new(
            store,
            OracleClient::new(self.oracle.clone(), RetryPolicy::none()),
            self.verifier.clone(),
            self.notifier.clone(),
        )
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone(), &["http://localhost:3000".to_string()])
            .expect("router should build")
    }

    pub async fn seed(&self) -> Seed {
        let org = Organization::new("acme");
        let owner = User::new("owner@acme.test", Some("Owner".to_string())).with_biometrics(true);
        let requester = User::new("dev@acme.test", Some("Dev".to_string()));
        let approvers: Vec<User> = (0..2)
            .map(|i| User::new(format!("approver{}@acme.test", i), None).with_biometrics(true))
            .collect();
        let outsider = User::new("outsider@acme.test", None).with_biometrics(true);
        let repository = Repository::new(org.organization_id, owner.user_id, "payments-api");
        let role = Role::new(
            org.organization_id,
            "maintainer",
            "Maintainer",
            ["read", "write", "merge"],
        );

        for user in [&owner, &requester, &outsider]
            .into_iter()
            .chain(approvers.iter())
        {
            self.store.insert_user(user).await.unwrap();
        }
        self.store.insert_organization(&org).await.unwrap();
        self.store.insert_repository(&repository).await.unwrap();
        self.store.insert_role(&role).await.unwrap();

        Seed {
            org,
            owner,
            requester,
            approvers,
            outsider,
            repository,
            role,
        }
    }

    /// Fresh biometric proof for `user_id` on `request_id`.
    pub fn token(&self, request_id: Uuid, user_id: Uuid) -> String {
        self.verifier.issue(request_id, user_id, Utc::now())
    }

    /// Single-approval role request from the seeded requester.
    pub async fn request_role(&self, seed: &Seed) -> AccessRequest {
        self.workflow
            .registry
            .create(
                CreateAccessRequest {
                    requester_id: seed.requester.user_id,
                    repository_id: seed.repository.repository_id,
                    role_id: Some(seed.role.role_id),
                    reason: "release duty".to_string(),
                    ..Default::default()
                },
                &ClientContext::default(),
            )
            .await
            .unwrap()
    }

    /// Multi-approval role request naming every seeded approver.
    pub async fn request_role_with_quorum(&self, seed: &Seed) -> AccessRequest {
        self.workflow
            .registry
            .create(
                CreateAccessRequest {
                    requester_id: seed.requester.user_id,
                    repository_id: seed.repository.repository_id,
                    role_id: Some(seed.role.role_id),
                    reason: "incident response".to_string(),
                    approver_ids: Some(seed.approvers.iter().map(|u| u.user_id).collect()),
                    requires_multi_approval: Some(true),
                    ..Default::default()
                },
                &ClientContext::default(),
            )
            .await
            .unwrap()
    }

    /// Audit actions recorded for one access request, oldest first.
    pub async fn actions_for(&self, request_id: Uuid) -> Vec<String> {
        self.workflow
            .audit
            .history("access_request", &request_id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }
}
