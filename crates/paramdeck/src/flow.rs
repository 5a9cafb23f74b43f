//! Create-workspace flow.
//!
//! Resolves everything the create page needs from the REST API, opens a
//! [`ParameterSession`], drives a [`CreateWorkspaceForm`] from it and
//! submits the result.

use std::sync::Arc;
use std::time::Duration;

use paramdeck_telemetry::{log_workspace_created, MetricsRegistry};
use reqwest::Url;
use uuid::Uuid;

use crate::api::{
    ApiClient, AuthorizationRequest, CreateWorkspaceRequest, Preset, Template, TemplateVersionExternalAuth, User,
    Workspace, WorkspaceBuildParameter, CREATE_WORKSPACE_FOR_ANY,
};
use crate::autofill::{self, AutofillParameter, AutofillSource};
use crate::client::DynamicParameterClient;
use crate::error::ClientError;
use crate::external_auth::{self, ExternalAuthPoller, PollingState, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::names;
use crate::presets::PresetSelection;
use crate::session::{ParameterSession, SessionOptions, SessionView, DEFAULT_DEBOUNCE};
use crate::view::{CreateWorkspaceForm, CreateWorkspaceMode};

/// How long to wait for the evaluation service to answer.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Owner value meaning the current user.
pub const ME: &str = "me";

/// Settings carried by a create-workspace link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageQuery {
    pub name: Option<String>,
    pub version: Option<String>,
    pub mode: Option<CreateWorkspaceMode>,
    pub disabled_params: Vec<String>,
    pub autofill: Vec<AutofillParameter>,
}

impl PageQuery {
    /// Read `name`, `version`, `mode`, `disable_params` and `param.*`.
    pub fn from_url(url: &Url) -> Result<Self, ClientError> {
        let mut query = PageQuery {
            autofill: autofill::from_url(url),
            ..PageQuery::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "name" if !value.is_empty() => query.name = Some(value.into_owned()),
                "version" if !value.is_empty() => query.version = Some(value.into_owned()),
                "mode" => query.mode = Some(value.parse()?),
                "disable_params" => query.disabled_params.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string),
                ),
                _ => {}
            }
        }
        Ok(query)
    }

    /// Parse a bare query string such as `mode=auto&param.region=eu`.
    pub fn parse(query: &str) -> Result<Self, ClientError> {
        let mut url =
            Url::parse("http://localhost/").map_err(|e| ClientError::Config(format!("invalid query: {e}")))?;
        url.set_query(Some(query.trim_start_matches('?')));
        Self::from_url(&url)
    }

    /// Fill `options` with the link's settings. Settings already present in
    /// `options` are kept, and link values rank below explicit values.
    pub fn apply_to(self, options: &mut FlowOptions) {
        if options.name.is_none() {
            options.name = self.name;
        }
        if options.version.is_none() {
            options.version = self.version;
        }
        if let Some(mode) = self.mode {
            if options.mode == CreateWorkspaceMode::Form {
                options.mode = mode;
            }
        }
        options.disabled_params.extend(self.disabled_params);
        let explicit = std::mem::take(&mut options.autofill);
        options.autofill = autofill::merge(self.autofill.into_iter().chain(explicit));
    }
}

/// Inputs to the flow.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub organization: String,
    pub template: String,
    /// Version name or id. The active version when unset.
    pub version: Option<String>,
    /// Username or id of the owner. The current user when unset.
    pub owner: Option<String>,
    pub name: Option<String>,
    pub mode: CreateWorkspaceMode,
    pub preset: Option<String>,
    pub autofill: Vec<AutofillParameter>,
    pub disabled_params: Vec<String>,
    /// `name` or `owner/name` of a workspace to copy values from.
    pub duplicate_from: Option<String>,
    /// Use the values of the user's earlier builds.
    pub use_history: bool,
    /// Poll for missing external auth instead of failing.
    pub wait_for_external_auth: bool,
    pub debounce: Duration,
    pub ready_timeout: Duration,
    pub external_auth_interval: Duration,
    pub external_auth_timeout: Duration,
}

impl FlowOptions {
    pub fn new(organization: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            template: template.into(),
            version: None,
            owner: None,
            name: None,
            mode: CreateWorkspaceMode::Form,
            preset: None,
            autofill: Vec::new(),
            disabled_params: Vec::new(),
            duplicate_from: None,
            use_history: true,
            wait_for_external_auth: false,
            debounce: DEFAULT_DEBOUNCE,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            external_auth_interval: DEFAULT_POLL_INTERVAL,
            external_auth_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Everything resolved before the session opens.
#[derive(Debug, Clone)]
pub struct PreparedWorkspace {
    pub template: Template,
    pub version_id: Uuid,
    /// The signed-in user.
    pub user: User,
    pub owner: User,
    pub can_create_for_any: bool,
    pub external_auth: Vec<TemplateVersionExternalAuth>,
    pub presets: Vec<Preset>,
    /// Merged autofill values, highest precedence last.
    pub autofill: Vec<AutofillParameter>,
}

pub struct CreateWorkspaceFlow {
    api: ApiClient,
    client: DynamicParameterClient,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl CreateWorkspaceFlow {
    pub fn new(api: ApiClient, client: DynamicParameterClient) -> Self {
        let metrics = client.metrics().cloned();
        Self { api, client, metrics }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Resolve template, version, owner, permissions, external auth,
    /// presets and autofill values.
    pub async fn prepare(&self, options: &FlowOptions) -> Result<PreparedWorkspace, ClientError> {
        let template = self
            .api
            .template_by_name(&options.organization, &options.template)
            .await?;

        let version_id = match options.version.as_deref() {
            None => template.active_version_id,
            Some(version) => match Uuid::parse_str(version) {
                Ok(id) => id,
                Err(_) => self.api.template_version_by_name(template.id, version).await?.id,
            },
        };

        let user = self.api.current_user().await?;
        let permissions = self
            .api
            .check_authorization(&AuthorizationRequest::create_workspace_for_any(template.organization_id))
            .await?;
        let can_create_for_any = permissions.get(CREATE_WORKSPACE_FOR_ANY).copied().unwrap_or(false);

        let owner = match options.owner.as_deref() {
            None | Some(ME) => user.clone(),
            Some(owner) if owner == user.username || owner == user.id.to_string() => user.clone(),
            Some(owner) => {
                if !can_create_for_any {
                    return Err(ClientError::Forbidden(format!(
                        "{} may not create workspaces for {owner}",
                        user.username
                    )));
                }
                self.api.user(owner).await?
            }
        };

        let external_auth = self.api.template_version_external_auth(version_id).await?;
        let presets = self.api.presets(version_id).await?;

        let history = if options.use_history {
            self.api
                .autofill_parameters(template.id)
                .await?
                .into_iter()
                .map(|p| AutofillParameter::new(p.name, p.value, AutofillSource::UserHistory))
                .collect()
        } else {
            Vec::new()
        };

        let duplicated = match options.duplicate_from.as_deref() {
            Some(source) => self.duplicate_values(source).await?,
            None => Vec::new(),
        };

        let autofill = autofill::merge(
            history
                .into_iter()
                .chain(duplicated)
                .chain(options.autofill.iter().cloned()),
        );

        tracing::debug!(
            template = %template.name,
            version_id = %version_id,
            owner = %owner.username,
            external_auth = external_auth.len(),
            presets = presets.len(),
            autofill = autofill.len(),
            "Prepared workspace creation"
        );

        Ok(PreparedWorkspace {
            template,
            version_id,
            user,
            owner,
            can_create_for_any,
            external_auth,
            presets,
            autofill,
        })
    }

    async fn duplicate_values(&self, source: &str) -> Result<Vec<AutofillParameter>, ClientError> {
        let (owner, name) = source.split_once('/').unwrap_or((ME, source));
        let workspace = self.api.workspace_by_owner_and_name(owner, name).await?;
        let build = workspace
            .latest_build
            .ok_or_else(|| ClientError::NotFound(format!("workspace {source} has no builds")))?;

        let values = self.api.workspace_build_parameters(build.id).await?;
        Ok(values
            .into_iter()
            .map(|p| AutofillParameter::new(p.name, p.value, AutofillSource::Duplicate))
            .collect())
    }

    /// Open the session and build the form around it.
    pub fn open(
        &self,
        prepared: &PreparedWorkspace,
        options: &FlowOptions,
    ) -> Result<(ParameterSession, CreateWorkspaceForm), ClientError> {
        let session_options = SessionOptions::new(prepared.version_id, prepared.owner.id)
            .with_autofill(prepared.autofill.clone())
            .with_debounce(options.debounce);
        let session = ParameterSession::open(&self.client, session_options)?;

        let mut presets = PresetSelection::new(prepared.presets.clone());
        if let Some(preset) = &options.preset {
            presets.select_by_name(preset)?;
        }

        let mode = if options.duplicate_from.is_some() {
            CreateWorkspaceMode::Duplicate
        } else {
            options.mode
        };

        let form = CreateWorkspaceForm::new(prepared.template.clone(), prepared.version_id, prepared.owner.clone(), mode)
            .with_name(options.name.clone().unwrap_or_default())
            .with_disabled_params(options.disabled_params.iter().cloned())
            .with_presets(presets)
            .with_external_auth(prepared.external_auth.clone());

        Ok((session, form))
    }

    /// Wait for the first snapshot and apply the selected preset.
    pub async fn settle(
        &self,
        session: &mut ParameterSession,
        form: &mut CreateWorkspaceForm,
        timeout: Duration,
    ) -> Result<SessionView, ClientError> {
        let view = within(timeout, "waiting for parameters", session.wait_until_ready()).await?;
        form.update(view);

        if let Some(inputs) = form.preset_inputs() {
            session.send_message(inputs, None).await?;
        }

        let view = within(timeout, "waiting for parameters", session.wait_until_caught_up()).await?;
        form.update(view.clone());
        Ok(view)
    }

    /// Apply edits one at a time, waiting for each evaluation.
    pub async fn edit(
        &self,
        session: &ParameterSession,
        form: &mut CreateWorkspaceForm,
        edits: &[(String, String)],
        timeout: Duration,
    ) -> Result<SessionView, ClientError> {
        let mut view = session.view();
        for (name, value) in edits {
            if form.is_field_disabled(name) {
                return Err(ClientError::Config(format!("parameter {name:?} cannot be changed")));
            }
            if !session.set_input(name.clone(), value.clone()) {
                return Err(ClientError::SessionClosed);
            }
            view = within(timeout, "waiting for evaluation", wait_for_edit(session, name, value)).await?;
            form.update(view.clone());
        }
        Ok(view)
    }

    /// Run the whole flow without interaction.
    pub async fn run(&self, options: &FlowOptions) -> Result<Workspace, ClientError> {
        let prepared = self.prepare(options).await?;

        if options.mode == CreateWorkspaceMode::Auto {
            match self.auto_create(&prepared, options).await {
                Ok(Some(workspace)) => return Ok(workspace),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Automatic creation failed, falling back to the form");
                }
            }
        }

        let (mut session, mut form) = self.open(&prepared, options)?;
        if options.mode == CreateWorkspaceMode::Auto {
            form.set_mode(CreateWorkspaceMode::Form);
        }

        let result = self.complete(&mut session, &mut form, &prepared, options).await;
        session.close();
        result
    }

    async fn complete(
        &self,
        session: &mut ParameterSession,
        form: &mut CreateWorkspaceForm,
        prepared: &PreparedWorkspace,
        options: &FlowOptions,
    ) -> Result<Workspace, ClientError> {
        self.settle(session, form, options.ready_timeout).await?;

        if !form.has_all_required_external_auth() {
            let poller = ExternalAuthPoller::new(self.api.clone(), prepared.version_id, prepared.external_auth.clone())
                .with_interval(options.external_auth_interval)
                .with_timeout(options.external_auth_timeout);
            self.await_external_auth(&poller, options.wait_for_external_auth).await?;
            form.set_external_auth(poller.providers());
        }

        if form.name().is_empty() {
            form.use_suggested_name();
            tracing::info!(name = %form.name(), "Using suggested workspace name");
        }

        self.submit(form).await
    }

    async fn await_external_auth(&self, poller: &ExternalAuthPoller, wait: bool) -> Result<(), ClientError> {
        if !wait {
            let missing = external_auth::missing_required(&poller.providers())
                .into_iter()
                .map(|p| p.id.clone())
                .collect();
            return Err(ClientError::ExternalAuthRequired(missing));
        }

        match poller.poll().await {
            PollingState::Abandoned => Err(ClientError::ExternalAuthAbandoned(poller.timeout().as_secs())),
            PollingState::Idle | PollingState::Polling => Ok(()),
        }
    }

    /// Create from autofill values alone. `None` when auto mode does not
    /// apply because external auth is missing.
    async fn auto_create(
        &self,
        prepared: &PreparedWorkspace,
        options: &FlowOptions,
    ) -> Result<Option<Workspace>, ClientError> {
        if !external_auth::has_all_required(&prepared.external_auth) {
            tracing::info!("Required external auth missing, using the form");
            return Ok(None);
        }

        let request = CreateWorkspaceRequest {
            template_id: None,
            template_version_id: Some(prepared.version_id),
            name: options
                .name
                .clone()
                .unwrap_or_else(names::generate_workspace_name),
            rich_parameter_values: prepared
                .autofill
                .iter()
                .map(|p| WorkspaceBuildParameter {
                    name: p.name.clone(),
                    value: p.value.clone(),
                })
                .collect(),
            template_version_preset_id: None,
        };

        self.create(&prepared.owner, &request).await.map(Some)
    }

    /// Validate the form and create the workspace.
    pub async fn submit(&self, form: &mut CreateWorkspaceForm) -> Result<Workspace, ClientError> {
        let request = form.build_request()?;
        form.start_creating();

        let owner = form.owner().clone();
        match self.create(&owner, &request).await {
            Ok(workspace) => {
                form.finish_creating(None);
                Ok(workspace)
            }
            Err(e) => {
                form.finish_creating(Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn create(&self, owner: &User, request: &CreateWorkspaceRequest) -> Result<Workspace, ClientError> {
        let result = self.api.create_workspace(&owner.username, request).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_workspace_created(if result.is_ok() { "created" } else { "failed" });
        }
        if let Ok(workspace) = &result {
            log_workspace_created!(
                workspace_id = %workspace.id,
                name = %workspace.name,
                owner = %owner.username,
                parameters = request.rich_parameter_values.len()
            );
        }
        result
    }
}

async fn wait_for_edit(session: &ParameterSession, name: &str, value: &str) -> Result<SessionView, ClientError> {
    let mut rx = session.subscribe();
    let view = rx
        .wait_for(|view| {
            view.is_finished() || (view.inputs.get(name).map(String::as_str) == Some(value) && view.is_caught_up())
        })
        .await
        .map_err(|_| ClientError::SessionClosed)?
        .clone();

    match &view.error {
        Some(error) => Err(error.clone().into()),
        None if view.is_caught_up() => Ok(view),
        None => Err(ClientError::SessionClosed),
    }
}

async fn within<T>(
    timeout: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ClientError::Timeout(what.to_string()))?
}
