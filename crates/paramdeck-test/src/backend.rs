//! TestBackend: mocked deployment REST API.

use paramdeck_lib::api::{
    CreateWorkspaceRequest, Preset, Template, TemplateVersionExternalAuth, User, UserParameter, Workspace,
    WorkspaceBuild, WorkspaceBuildParameter, CREATE_WORKSPACE_FOR_ANY,
};
use paramdeck_lib::config::ClientConfig;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::evaluator::TestEvaluator;
use crate::fixtures;
use crate::TestError;

/// Session token the backend hands out to tests.
pub const SESSION_TOKEN: &str = "paramdeck-test-token";

/// Priority of the baseline mocks. Anything mounted later with the default
/// priority takes precedence.
const BASELINE_PRIORITY: u8 = 10;

/// Mocked REST API for one template owned by one signed-in user.
///
/// Starts with a template, the current user, no external auth, no presets,
/// no autofill history and no permission to create for other users. The
/// `with_*` methods layer more specific responses on top.
pub struct TestBackend {
    server: MockServer,
    pub template: Template,
    pub user: User,
}

impl TestBackend {
    pub async fn start() -> Self {
        Self::for_template(fixtures::template("docker"), fixtures::user("alice")).await
    }

    pub async fn for_template(template: Template, user: User) -> Self {
        let server = MockServer::start().await;
        let version_id = template.active_version_id;

        baseline(
            &server,
            "GET",
            &format!(
                "/api/v2/organizations/{}/templates/{}",
                template.organization_name, template.name
            ),
            ResponseTemplate::new(200).set_body_json(&template),
        )
        .await;
        baseline(
            &server,
            "GET",
            "/api/v2/users/me",
            ResponseTemplate::new(200).set_body_json(&user),
        )
        .await;
        baseline(
            &server,
            "POST",
            "/api/v2/authcheck",
            ResponseTemplate::new(200).set_body_json(json!({ CREATE_WORKSPACE_FOR_ANY: false })),
        )
        .await;
        baseline(
            &server,
            "GET",
            &format!("/api/v2/templateversions/{version_id}/external-auth"),
            ResponseTemplate::new(200).set_body_json(json!([])),
        )
        .await;
        baseline(
            &server,
            "GET",
            &format!("/api/v2/templateversions/{version_id}/presets"),
            ResponseTemplate::new(200).set_body_json(json!([])),
        )
        .await;
        baseline(
            &server,
            "GET",
            "/api/v2/users/me/autofill-parameters",
            ResponseTemplate::new(200).set_body_json(json!([])),
        )
        .await;

        Self { server, template, user }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Client config pointing REST calls here and evaluation at `evaluator`.
    pub fn config(&self, evaluator: &TestEvaluator) -> Result<ClientConfig, TestError> {
        Ok(ClientConfig::new(&self.uri())?
            .with_session_token(SESSION_TOKEN)
            .with_websocket_url(&evaluator.ws_url())?)
    }

    pub async fn grant_create_for_any(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v2/authcheck"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ CREATE_WORKSPACE_FOR_ANY: true })))
            .mount(&self.server)
            .await;
    }

    /// Make `user` resolvable by username.
    pub async fn with_user(&self, user: &User) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/users/{}", user.username)))
            .respond_with(ResponseTemplate::new(200).set_body_json(user))
            .mount(&self.server)
            .await;
    }

    pub async fn with_presets(&self, presets: &[Preset]) {
        Mock::given(method("GET"))
            .and(path(self.version_path("presets")))
            .respond_with(ResponseTemplate::new(200).set_body_json(presets))
            .mount(&self.server)
            .await;
    }

    pub async fn with_external_auth(&self, providers: &[TemplateVersionExternalAuth]) {
        Mock::given(method("GET"))
            .and(path(self.version_path("external-auth")))
            .respond_with(ResponseTemplate::new(200).set_body_json(providers))
            .mount(&self.server)
            .await;
    }

    /// Answer the next `times` provider lookups with `providers`, ahead of
    /// anything mounted with [`with_external_auth`](Self::with_external_auth).
    pub async fn with_external_auth_for(&self, providers: &[TemplateVersionExternalAuth], times: u64) {
        Mock::given(method("GET"))
            .and(path(self.version_path("external-auth")))
            .respond_with(ResponseTemplate::new(200).set_body_json(providers))
            .up_to_n_times(times)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Values from the user's earlier builds.
    pub async fn with_history(&self, values: &[(&str, &str)]) {
        let values: Vec<UserParameter> = values
            .iter()
            .map(|(name, value)| UserParameter {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/v2/users/me/autofill-parameters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(values))
            .mount(&self.server)
            .await;
    }

    /// An existing workspace of the current user whose latest build used
    /// `values`.
    pub async fn with_workspace(&self, name: &str, values: &[(&str, &str)]) -> Workspace {
        let build_id = Uuid::new_v4();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: self.user.id,
            owner_name: self.user.username.clone(),
            template_id: self.template.id,
            created_at: None,
            latest_build: Some(WorkspaceBuild {
                id: build_id,
                template_version_id: self.template.active_version_id,
                build_number: 1,
                status: "running".to_string(),
            }),
        };
        let values: Vec<WorkspaceBuildParameter> = values
            .iter()
            .map(|(name, value)| WorkspaceBuildParameter {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();

        Mock::given(method("GET"))
            .and(path(format!("/api/v2/users/me/workspace/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(&workspace))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/workspacebuilds/{build_id}/parameters")))
            .respond_with(ResponseTemplate::new(200).set_body_json(values))
            .mount(&self.server)
            .await;

        workspace
    }

    /// Accept creation requests for `owner`, answering with a workspace
    /// named as requested.
    pub async fn accept_creation(&self, owner: &User) {
        let owner = owner.clone();
        let template_id = self.template.id;
        let username = owner.username.clone();

        Mock::given(method("POST"))
            .and(path(format!("/api/v2/users/{username}/workspaces")))
            .respond_with(move |request: &Request| {
                let Ok(body) = serde_json::from_slice::<CreateWorkspaceRequest>(&request.body) else {
                    return ResponseTemplate::new(400).set_body_json(json!({ "message": "invalid request body" }));
                };
                let workspace = Workspace {
                    id: Uuid::new_v4(),
                    name: body.name,
                    owner_id: owner.id,
                    owner_name: owner.username.clone(),
                    template_id,
                    created_at: None,
                    latest_build: None,
                };
                ResponseTemplate::new(201).set_body_json(workspace)
            })
            .mount(&self.server)
            .await;
    }

    /// Reject the next `times` creation requests for `owner`.
    pub async fn reject_creation(&self, owner: &User, status: u16, message: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path(format!("/api/v2/users/{}/workspaces", owner.username)))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "message": message })))
            .up_to_n_times(times)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Creation requests received so far, successful or not.
    pub async fn creation_requests(&self) -> Vec<CreateWorkspaceRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path().ends_with("/workspaces"))
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }

    fn version_path(&self, resource: &str) -> String {
        format!(
            "/api/v2/templateversions/{}/{resource}",
            self.template.active_version_id
        )
    }
}

async fn baseline(server: &MockServer, verb: &str, route: &str, response: ResponseTemplate) {
    Mock::given(method(verb))
        .and(path(route))
        .respond_with(response)
        .with_priority(BASELINE_PRIORITY)
        .mount(server)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{dropdown_parameter, external_auth, number_parameter, preset, user};
    use paramdeck_lib::autofill::{AutofillParameter, AutofillSource};
    use paramdeck_lib::client::DynamicParameterClient;
    use paramdeck_lib::flow::{CreateWorkspaceFlow, FlowOptions};
    use paramdeck_lib::protocol::PreviewParameter;
    use paramdeck_lib::{ApiClient, ClientError, CreateWorkspaceMode};
    use std::time::Duration;

    fn parameters() -> Vec<PreviewParameter> {
        let mut region = dropdown_parameter("region", "us", &["us", "eu", "ap"]);
        region.order = 1;
        let mut cpu = number_parameter("cpu", 2);
        cpu.order = 2;
        vec![region, cpu]
    }

    fn flow_for(backend: &TestBackend, evaluator: &TestEvaluator) -> CreateWorkspaceFlow {
        let config = backend.config(evaluator).unwrap();
        let api = ApiClient::new(config.clone()).unwrap();
        CreateWorkspaceFlow::new(api, DynamicParameterClient::new(config))
    }

    fn options(backend: &TestBackend, name: &str) -> FlowOptions {
        let mut options = FlowOptions::new("default", backend.template.name.clone());
        options.name = Some(name.to_string());
        options.debounce = Duration::ZERO;
        options.ready_timeout = Duration::from_secs(5);
        options
    }

    fn values(request: &CreateWorkspaceRequest) -> Vec<(&str, &str)> {
        request
            .rich_parameter_values
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn test_flow_creates_workspace_from_seeded_values() {
        let backend = TestBackend::start().await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let workspace = flow.run(&options(&backend, "dev-box")).await.unwrap();
        assert_eq!(workspace.name, "dev-box");
        assert_eq!(workspace.owner_id, backend.user.id);

        let requests = backend.creation_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].template_version_id, Some(backend.template.active_version_id));
        assert_eq!(values(&requests[0]), [("region", "us"), ("cpu", "2")]);
        assert_eq!(requests[0].template_version_preset_id, None);

        let connection = evaluator.wait_for_connections(1).await.unwrap().remove(0);
        assert!(connection
            .path
            .contains(&backend.template.active_version_id.to_string()));
        assert_eq!(connection.query, Some(format!("user_id={}", backend.user.id)));
        assert_eq!(connection.session_token.as_deref(), Some(SESSION_TOKEN));
    }

    #[tokio::test]
    async fn test_flags_beat_history() {
        let backend = TestBackend::start().await;
        backend.with_history(&[("region", "eu"), ("cpu", "3")]).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.autofill = vec![AutofillParameter::new("cpu", "4", AutofillSource::Flag)];
        flow.run(&options).await.unwrap();

        let requests = backend.creation_requests().await;
        assert_eq!(values(&requests[0]), [("region", "eu"), ("cpu", "4")]);
    }

    #[tokio::test]
    async fn test_history_ignored_when_disabled() {
        let backend = TestBackend::start().await;
        backend.with_history(&[("region", "eu")]).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.use_history = false;
        flow.run(&options).await.unwrap();

        let requests = backend.creation_requests().await;
        assert_eq!(values(&requests[0]), [("region", "us"), ("cpu", "2")]);
    }

    #[tokio::test]
    async fn test_default_preset_applied_and_sent() {
        let backend = TestBackend::start().await;
        let gpu = preset("GPU", &[("region", "ap")], true);
        backend.with_presets(&[preset("Small", &[("cpu", "1")], false), gpu.clone()]).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        flow.run(&options(&backend, "dev-box")).await.unwrap();

        // Seed, then the preset's values as a second full-state request.
        let sent = evaluator.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].inputs.get("region").map(String::as_str), Some("ap"));
        assert_eq!(sent[1].inputs.get("cpu").map(String::as_str), Some("2"));

        let requests = backend.creation_requests().await;
        assert_eq!(requests[0].template_version_preset_id, Some(gpu.id));
        assert_eq!(values(&requests[0]), [("region", "ap"), ("cpu", "2")]);
    }

    #[tokio::test]
    async fn test_other_owner_requires_permission() {
        let backend = TestBackend::start().await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.owner = Some("bob".to_string());
        let err = flow.run(&options).await.unwrap_err();

        assert!(matches!(err, ClientError::Forbidden(_)));
        assert!(evaluator.connections().is_empty());
    }

    #[tokio::test]
    async fn test_create_for_other_owner() {
        let backend = TestBackend::start().await;
        let bob = user("bob");
        backend.grant_create_for_any().await;
        backend.with_user(&bob).await;
        backend.accept_creation(&bob).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "bobs-box");
        options.owner = Some("bob".to_string());
        let workspace = flow.run(&options).await.unwrap();

        assert_eq!(workspace.owner_id, bob.id);
        let connection = evaluator.wait_for_connections(1).await.unwrap().remove(0);
        assert_eq!(connection.query, Some(format!("user_id={}", bob.id)));
    }

    #[tokio::test]
    async fn test_missing_external_auth_blocks_creation() {
        let backend = TestBackend::start().await;
        backend
            .with_external_auth(&[external_auth("github", false), external_auth("gitlab", true)])
            .await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let err = flow.run(&options(&backend, "dev-box")).await.unwrap_err();
        match err {
            ClientError::ExternalAuthRequired(missing) => assert_eq!(missing, ["github"]),
            other => panic!("expected external auth error, got {other:?}"),
        }
        assert!(backend.creation_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_external_auth_polling_abandoned() {
        let backend = TestBackend::start().await;
        backend.with_external_auth(&[external_auth("github", false)]).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.wait_for_external_auth = true;
        options.external_auth_interval = Duration::from_millis(20);
        options.external_auth_timeout = Duration::from_millis(100);

        let err = flow.run(&options).await.unwrap_err();
        assert!(matches!(err, ClientError::ExternalAuthAbandoned(_)));
        assert!(backend.creation_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_external_auth_completes_while_polling() {
        let backend = TestBackend::start().await;
        backend.with_external_auth(&[external_auth("github", true)]).await;
        // Lookup during preparation plus the first poll.
        backend.with_external_auth_for(&[external_auth("github", false)], 2).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.wait_for_external_auth = true;
        options.external_auth_interval = Duration::from_millis(20);
        options.external_auth_timeout = Duration::from_secs(5);

        let workspace = flow.run(&options).await.unwrap();
        assert_eq!(workspace.name, "dev-box");
    }

    #[tokio::test]
    async fn test_auto_mode_creates_without_form() {
        let backend = TestBackend::start().await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "auto-box");
        options.mode = CreateWorkspaceMode::Auto;
        options.autofill = vec![AutofillParameter::new("region", "eu", AutofillSource::Url)];
        flow.run(&options).await.unwrap();

        let requests = backend.creation_requests().await;
        assert_eq!(values(&requests[0]), [("region", "eu")]);
        assert!(evaluator.connections().is_empty());
    }

    #[tokio::test]
    async fn test_auto_mode_falls_back_to_form() {
        let backend = TestBackend::start().await;
        backend.reject_creation(&backend.user, 400, "Validation failed for parameter cpu", 1).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "auto-box");
        options.mode = CreateWorkspaceMode::Auto;
        let workspace = flow.run(&options).await.unwrap();
        assert_eq!(workspace.name, "auto-box");

        let requests = backend.creation_requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[0].rich_parameter_values.is_empty());
        assert_eq!(values(&requests[1]), [("region", "us"), ("cpu", "2")]);
        assert_eq!(evaluator.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_copies_build_values() {
        let backend = TestBackend::start().await;
        backend.with_workspace("old-box", &[("region", "ap"), ("cpu", "6")]).await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "old-box-copy");
        options.duplicate_from = Some("old-box".to_string());
        flow.run(&options).await.unwrap();

        let requests = backend.creation_requests().await;
        assert_eq!(values(&requests[0]), [("region", "ap"), ("cpu", "6")]);
    }

    #[tokio::test]
    async fn test_creation_error_surfaces() {
        let backend = TestBackend::start().await;
        backend.reject_creation(&backend.user, 409, "Workspace \"dev-box\" already exists.", 1).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let err = flow.run(&options(&backend, "dev-box")).await.unwrap_err();
        match err {
            ClientError::Api { status, message, .. } => {
                assert_eq!(status, 409);
                assert!(message.contains("already exists"));
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_request() {
        let backend = TestBackend::start().await;
        backend.accept_creation(&backend.user).await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let err = flow.run(&options(&backend, "not a name")).await.unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("Please enter a valid workspace name."));
        assert!(backend.creation_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_seed_times_out() {
        let backend = TestBackend::start().await;
        let evaluator = TestEvaluator::silent(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);

        let mut options = options(&backend, "dev-box");
        options.ready_timeout = Duration::from_millis(200);
        let err = flow.run(&options).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_edits_wait_for_evaluation() {
        let backend = TestBackend::start().await;
        let evaluator = TestEvaluator::start(parameters()).await.unwrap();
        let flow = flow_for(&backend, &evaluator);
        let options = options(&backend, "dev-box");

        let prepared = flow.prepare(&options).await.unwrap();
        let (mut session, mut form) = flow.open(&prepared, &options).unwrap();
        flow.settle(&mut session, &mut form, options.ready_timeout).await.unwrap();

        let edits = vec![
            ("region".to_string(), "eu".to_string()),
            ("cpu".to_string(), "8".to_string()),
        ];
        let view = flow
            .edit(&session, &mut form, &edits, options.ready_timeout)
            .await
            .unwrap();

        assert_eq!(view.parameter("region").unwrap().value.valid_value(), "eu");
        assert_eq!(form.inputs().get("cpu").map(String::as_str), Some("8"));

        // Seed plus one full-state request per edit.
        let sent = evaluator.requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].inputs.get("region").map(String::as_str), Some("eu"));
        session.close();
    }
}
