//! REST client for the deployment API.
//!
//! Covers the collaborators of the create-workspace flow: templates and
//! versions, the current user and permissions, external auth, presets,
//! autofill history, workspace creation and one-shot evaluation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ClientConfig, SESSION_TOKEN_HEADER};
use crate::error::ClientError;
use crate::protocol::{DynamicParametersRequest, DynamicParametersResponse, Inputs};

/// Permission check that gates choosing another owner.
pub const CREATE_WORKSPACE_FOR_ANY: &str = "createWorkspaceForAny";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub organization_id: Uuid,
    #[serde(default)]
    pub organization_name: String,
    pub active_version_id: Uuid,
    #[serde(default)]
    pub require_active_version: bool,
}

impl Template {
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// A name/value pair recorded on a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBuildParameter {
    pub name: String,
    pub value: String,
}

/// Body of `POST /api/v2/users/{user}/workspaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version_id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rich_parameter_values: Vec<WorkspaceBuildParameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version_preset_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub id: Uuid,
    pub template_version_id: Uuid,
    #[serde(default)]
    pub build_number: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    #[serde(default)]
    pub owner_name: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_build: Option<WorkspaceBuild>,
}

/// An external auth provider required by a template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVersionExternalAuth {
    pub id: String,
    #[serde(rename = "type", default)]
    pub provider_type: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub authenticate_url: String,
    pub authenticated: bool,
    #[serde(default)]
    pub optional: bool,
}

/// Status of one external auth provider for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAuth {
    pub authenticated: bool,
    #[serde(default)]
    pub device: bool,
    #[serde(default)]
    pub display_name: String,
}

/// A value fixed by a preset. The backend emits these keys in PascalCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PresetParameter {
    pub name: String,
    pub value: String,
}

/// A named bundle of parameter values declared by a template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Preset {
    #[serde(rename = "ID")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<PresetParameter>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub description: String,
}

/// A value the user chose in an earlier build of the same template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationObject {
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCheck {
    pub object: AuthorizationObject,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub checks: BTreeMap<String, AuthorizationCheck>,
}

/// Check name to granted.
pub type AuthorizationResponse = BTreeMap<String, bool>;

impl AuthorizationRequest {
    /// The check the create page runs before offering an owner picker.
    pub fn create_workspace_for_any(organization_id: Uuid) -> Self {
        let mut checks = BTreeMap::new();
        checks.insert(
            CREATE_WORKSPACE_FOR_ANY.to_string(),
            AuthorizationCheck {
                object: AuthorizationObject {
                    resource_type: "workspace".to_string(),
                    owner_id: Some("*".to_string()),
                    organization_id: Some(organization_id),
                },
                action: "create".to_string(),
            },
        );
        Self { checks }
    }
}

/// Error body returned by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    validations: Vec<ValidationError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ValidationError {
    field: String,
    detail: String,
}

impl ErrorBody {
    /// `detail` followed by one line per field validation.
    fn describe(self) -> Option<String> {
        let lines: Vec<String> = self
            .detail
            .into_iter()
            .filter(|d| !d.is_empty())
            .chain(self.validations.into_iter().map(|v| format!("{}: {}", v.field, v.detail)))
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}

/// Typed access to the deployment REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    /// Build a client sending the session token on every request.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.session_token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| ClientError::Config("session token is not a valid header value".to_string()))?;
            headers.insert(HeaderName::from_static(SESSION_TOKEN_HEADER), value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent(concat!("paramdeck/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn template_by_name(&self, organization: &str, name: &str) -> Result<Template, ClientError> {
        self.get(&format!("/api/v2/organizations/{organization}/templates/{name}"))
            .await
    }

    pub async fn template_version(&self, version_id: Uuid) -> Result<TemplateVersion, ClientError> {
        self.get(&format!("/api/v2/templateversions/{version_id}")).await
    }

    pub async fn template_version_by_name(
        &self,
        template_id: Uuid,
        name: &str,
    ) -> Result<TemplateVersion, ClientError> {
        self.get(&format!("/api/v2/templates/{template_id}/versions/{name}"))
            .await
    }

    pub async fn current_user(&self) -> Result<User, ClientError> {
        self.get("/api/v2/users/me").await
    }

    /// Look up a user by username or id.
    pub async fn user(&self, user: &str) -> Result<User, ClientError> {
        self.get(&format!("/api/v2/users/{user}")).await
    }

    pub async fn check_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResponse, ClientError> {
        self.post("/api/v2/authcheck", request).await
    }

    pub async fn template_version_external_auth(
        &self,
        version_id: Uuid,
    ) -> Result<Vec<TemplateVersionExternalAuth>, ClientError> {
        self.get(&format!("/api/v2/templateversions/{version_id}/external-auth"))
            .await
    }

    pub async fn external_auth(&self, provider: &str) -> Result<ExternalAuth, ClientError> {
        self.get(&format!("/api/v2/external-auth/{provider}")).await
    }

    pub async fn presets(&self, version_id: Uuid) -> Result<Vec<Preset>, ClientError> {
        self.get(&format!("/api/v2/templateversions/{version_id}/presets"))
            .await
    }

    /// Values the current user picked in earlier builds of `template_id`.
    pub async fn autofill_parameters(&self, template_id: Uuid) -> Result<Vec<UserParameter>, ClientError> {
        self.get(&format!(
            "/api/v2/users/me/autofill-parameters?template_id={template_id}"
        ))
        .await
    }

    /// Create a workspace owned by `owner` (a username, id, or `me`).
    pub async fn create_workspace(
        &self,
        owner: &str,
        request: &CreateWorkspaceRequest,
    ) -> Result<Workspace, ClientError> {
        self.post(&format!("/api/v2/users/{owner}/workspaces"), request)
            .await
    }

    pub async fn workspace_by_owner_and_name(&self, owner: &str, name: &str) -> Result<Workspace, ClientError> {
        self.get(&format!("/api/v2/users/{owner}/workspace/{name}")).await
    }

    /// Parameter values recorded on a build.
    pub async fn workspace_build_parameters(
        &self,
        build_id: Uuid,
    ) -> Result<Vec<WorkspaceBuildParameter>, ClientError> {
        self.get(&format!("/api/v2/workspacebuilds/{build_id}/parameters"))
            .await
    }

    /// Evaluate `inputs` once without opening a connection.
    pub async fn evaluate(
        &self,
        version_id: Uuid,
        owner_id: Uuid,
        inputs: Inputs,
    ) -> Result<DynamicParametersResponse, ClientError> {
        let request = DynamicParametersRequest {
            id: 0,
            owner_id: owner_id.to_string(),
            inputs,
        };
        self.post(
            &format!("/api/v2/templateversions/{version_id}/dynamic-parameters/evaluate"),
            &request,
        )
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.config.endpoint(path)?;
        tracing::debug!(method = "GET", url = %url, "API request");
        let response = self.http.get(url).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let url = self.config.endpoint(path)?;
        tracing::debug!(method = "POST", url = %url, "API request");
        let response = self.http.post(url).json(body).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    let body = response.bytes().await?;

    if status.is_success() {
        return Ok(serde_json::from_slice(&body)?);
    }

    let mut parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        std::mem::take(&mut parsed.message)
    };

    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(message));
    }

    Err(ClientError::Api {
        status: status.as_u16(),
        message,
        detail: parsed.describe(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ApiClient {
        let config = ClientConfig::new(&server.uri())
            .unwrap()
            .with_session_token("s3cr3t");
        ApiClient::new(config).unwrap()
    }

    #[test]
    fn test_preset_pascal_case() {
        let json = r#"{
            "ID": "4f2b1c3d-5e6f-4a7b-8c9d-0e1f2a3b4c5d",
            "Name": "Large",
            "Parameters": [{"Name": "cpu_count", "Value": "8"}],
            "Default": true
        }"#;
        let preset: Preset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.name, "Large");
        assert!(preset.default);
        assert_eq!(preset.parameters[0].value, "8");
    }

    #[test]
    fn test_create_request_omits_empty_fields() {
        let request = CreateWorkspaceRequest {
            template_id: None,
            template_version_id: Some(Uuid::nil()),
            name: "dev".to_string(),
            rich_parameter_values: Vec::new(),
            template_version_preset_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("template_id").is_none());
        assert!(json.get("rich_parameter_values").is_none());
        assert_eq!(json["name"], "dev");
    }

    #[tokio::test]
    async fn test_sends_session_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/users/me"))
            .and(header(SESSION_TOKEN_HEADER, "s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "6a5b4c3d-2e1f-4a0b-9c8d-7e6f5a4b3c2d",
                "username": "alice",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = client_for(&server).await.current_user().await.unwrap();
        assert_eq!(user.username, "alice");
    }

    #[tokio::test]
    async fn test_error_body_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/users/me/workspaces"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "message": "Workspace \"dev\" already exists.",
                "detail": "",
            })))
            .mount(&server)
            .await;

        let request = CreateWorkspaceRequest {
            template_id: Some(Uuid::new_v4()),
            template_version_id: None,
            name: "dev".to_string(),
            rich_parameter_values: Vec::new(),
            template_version_preset_id: None,
        };
        let err = client_for(&server)
            .await
            .create_workspace("me", &request)
            .await
            .unwrap_err();

        match err {
            ClientError::Api { status, message, detail } => {
                assert_eq!(status, 409);
                assert!(message.contains("already exists"));
                assert_eq!(detail, None);
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_field_validations_folded_into_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/users/me"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "message": "Invalid request.",
                "detail": "parameter check failed",
                "validations": [{"field": "cpu_count", "detail": "must be at most 8"}],
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).await.current_user().await.unwrap_err();
        match err {
            ClientError::Api { detail, .. } => {
                assert_eq!(
                    detail.as_deref(),
                    Some("parameter check failed\ncpu_count: must be at most 8")
                );
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/organizations/default/templates/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "message": "Template \"missing\" not found.",
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .template_by_name("default", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(ref m) if m.contains("missing")));
    }

    #[tokio::test]
    async fn test_autofill_parameters_query() {
        let server = MockServer::start().await;
        let template_id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/api/v2/users/me/autofill-parameters"))
            .and(query_param("template_id", template_id.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"name": "region", "value": "eu-west"}])),
            )
            .mount(&server)
            .await;

        let params = client_for(&server)
            .await
            .autofill_parameters(template_id)
            .await
            .unwrap();
        assert_eq!(params, vec![UserParameter { name: "region".to_string(), value: "eu-west".to_string() }]);
    }

    #[tokio::test]
    async fn test_evaluate_posts_full_inputs() {
        let server = MockServer::start().await;
        let version = Uuid::new_v4();
        let owner = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path(format!("/api/v2/templateversions/{version}/dynamic-parameters/evaluate")))
            .and(body_json(serde_json::json!({
                "id": 0,
                "owner_id": owner.to_string(),
                "inputs": {"region": "eu-west"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 0,
                "parameters": [],
                "diagnostics": [{"severity": "error", "summary": "no capacity"}],
            })))
            .mount(&server)
            .await;

        let inputs: Inputs = [("region".to_string(), "eu-west".to_string())].into();
        let response = client_for(&server)
            .await
            .evaluate(version, owner, inputs)
            .await
            .unwrap();
        assert!(response.diagnostics[0].is_error());
    }

    #[test]
    fn test_authcheck_body() {
        let org = Uuid::nil();
        let request = AuthorizationRequest::create_workspace_for_any(org);
        let json = serde_json::to_value(&request).unwrap();
        let check = &json["checks"][CREATE_WORKSPACE_FOR_ANY];
        assert_eq!(check["action"], "create");
        assert_eq!(check["object"]["resource_type"], "workspace");
        assert_eq!(check["object"]["owner_id"], "*");
    }
}
