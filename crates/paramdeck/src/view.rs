//! Create-workspace view-model.
//!
//! [`CreateWorkspaceForm`] holds everything the create page shows besides
//! the parameters themselves: name, owner, mode, presets, external auth,
//! the error banner. Parameters come from the latest [`SessionView`]; the
//! form never talks to the connection.

use std::collections::BTreeSet;
use std::str::FromStr;

use uuid::Uuid;

use crate::api::{CreateWorkspaceRequest, Template, TemplateVersionExternalAuth, User, WorkspaceBuildParameter};
use crate::error::{ClientError, ConnectionError, FormError};
use crate::external_auth;
use crate::names;
use crate::presets::PresetSelection;
use crate::protocol::{Diagnostic, Inputs, PreviewParameter};
use crate::session::SessionView;
use crate::validation::{self, FieldError};

/// How the page was entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreateWorkspaceMode {
    #[default]
    Form,
    /// Create immediately from the supplied values when possible.
    Auto,
    /// Values were copied from an existing workspace.
    Duplicate,
}

impl CreateWorkspaceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CreateWorkspaceMode::Form => "form",
            CreateWorkspaceMode::Auto => "auto",
            CreateWorkspaceMode::Duplicate => "duplicate",
        }
    }
}

impl FromStr for CreateWorkspaceMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(CreateWorkspaceMode::Form),
            "auto" => Ok(CreateWorkspaceMode::Auto),
            "duplicate" => Ok(CreateWorkspaceMode::Duplicate),
            other => Err(ClientError::Config(format!(
                "unknown mode {other:?}, expected form, auto or duplicate"
            ))),
        }
    }
}

/// One rendered parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldView<'a> {
    pub parameter: &'a PreviewParameter,
    pub value: &'a str,
    pub disabled: bool,
    /// Fixed by the selected preset.
    pub preset_locked: bool,
}

pub struct CreateWorkspaceForm {
    template: Template,
    version_id: Uuid,
    owner: User,
    mode: CreateWorkspaceMode,
    name: String,
    suggested_name: String,
    disabled_params: BTreeSet<String>,
    presets: PresetSelection,
    external_auth: Vec<TemplateVersionExternalAuth>,
    last_build: Inputs,
    session: SessionView,
    error: Option<String>,
    /// Last connection error raised as a banner, so a dismissed banner stays
    /// dismissed.
    raised_connection_error: Option<ConnectionError>,
    creating: bool,
}

impl CreateWorkspaceForm {
    pub fn new(template: Template, version_id: Uuid, owner: User, mode: CreateWorkspaceMode) -> Self {
        Self {
            template,
            version_id,
            owner,
            mode,
            name: String::new(),
            suggested_name: names::generate_workspace_name(),
            disabled_params: BTreeSet::new(),
            presets: PresetSelection::default(),
            external_auth: Vec::new(),
            last_build: Inputs::new(),
            session: SessionView::default(),
            error: None,
            raised_connection_error: None,
            creating: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parameters the page was told to render read-only.
    pub fn with_disabled_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_params = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_presets(mut self, presets: PresetSelection) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_external_auth(mut self, providers: Vec<TemplateVersionExternalAuth>) -> Self {
        self.external_auth = providers;
        self
    }

    /// Values of the previous build, for monotonic rules.
    pub fn with_last_build(mut self, values: Inputs) -> Self {
        self.last_build = values;
        self
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn owner(&self) -> &User {
        &self.owner
    }

    /// Change the owner. Returns true when it differs, in which case the
    /// caller reopens the session for the new owner.
    pub fn set_owner(&mut self, owner: User) -> bool {
        if owner.id == self.owner.id {
            return false;
        }
        self.owner = owner;
        true
    }

    pub fn mode(&self) -> CreateWorkspaceMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CreateWorkspaceMode) {
        self.mode = mode;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn suggested_name(&self) -> &str {
        &self.suggested_name
    }

    pub fn reroll_suggested_name(&mut self) -> &str {
        self.suggested_name = names::generate_workspace_name();
        &self.suggested_name
    }

    /// Take the suggestion as the name.
    pub fn use_suggested_name(&mut self) {
        self.name = self.suggested_name.clone();
    }

    /// Take in the latest session output.
    pub fn update(&mut self, view: SessionView) {
        if let Some(error) = &view.error {
            if self.raised_connection_error.as_ref() != Some(error) {
                self.error = Some(error.to_string());
                self.raised_connection_error = Some(error.clone());
            }
        }
        self.session = view;
    }

    pub fn session(&self) -> &SessionView {
        &self.session
    }

    pub fn parameters(&self) -> &[PreviewParameter] {
        &self.session.parameters
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.session.diagnostics
    }

    pub fn inputs(&self) -> &Inputs {
        &self.session.inputs
    }

    /// Parameters with their current values, in order.
    pub fn fields(&self) -> Vec<FieldView<'_>> {
        self.session
            .parameters
            .iter()
            .map(|parameter| FieldView {
                parameter,
                value: self
                    .session
                    .inputs
                    .get(&parameter.name)
                    .map(String::as_str)
                    .unwrap_or_else(|| parameter.value.valid_value()),
                disabled: self.is_field_disabled(&parameter.name),
                preset_locked: self.presets.is_locked(&parameter.name),
            })
            .collect()
    }

    pub fn is_field_disabled(&self, name: &str) -> bool {
        self.creating
            || self.disabled_params.contains(name)
            || self.presets.is_locked(name)
            || self
                .session
                .parameter(name)
                .is_some_and(PreviewParameter::is_styled_disabled)
    }

    pub fn presets(&self) -> &PresetSelection {
        &self.presets
    }

    /// Choose a preset (or none) and return the full inputs to send when the
    /// choice changed any value.
    pub fn select_preset(&mut self, id: Option<Uuid>) -> Result<Option<Inputs>, ClientError> {
        self.presets.select(id)?;
        Ok(self.preset_inputs())
    }

    /// Same as [`select_preset`](Self::select_preset), by display name.
    pub fn select_preset_by_name(&mut self, name: &str) -> Result<Option<Inputs>, ClientError> {
        self.presets.select_by_name(name)?;
        Ok(self.preset_inputs())
    }

    /// Inputs with the selected preset applied, if that changes anything.
    pub fn preset_inputs(&self) -> Option<Inputs> {
        let mut inputs = self.session.inputs.clone();
        self.presets
            .apply(&self.session.parameters, &mut inputs)
            .then_some(inputs)
    }

    pub fn external_auth(&self) -> &[TemplateVersionExternalAuth] {
        &self.external_auth
    }

    pub fn set_external_auth(&mut self, providers: Vec<TemplateVersionExternalAuth>) {
        self.external_auth = providers;
    }

    pub fn has_all_required_external_auth(&self) -> bool {
        external_auth::has_all_required(&self.external_auth)
    }

    /// The banner, if shown.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn start_creating(&mut self) {
        self.creating = true;
        self.error = None;
    }

    /// Leave the creating state, showing `error` when creation failed.
    pub fn finish_creating(&mut self, error: Option<String>) {
        self.creating = false;
        self.error = error;
    }

    /// Why submission is not possible right now.
    pub fn blocking_reason(&self) -> Option<String> {
        if self.creating {
            return Some("a workspace is already being created".to_string());
        }
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        let missing = external_auth::missing_required(&self.external_auth);
        if !missing.is_empty() {
            let names: Vec<&str> = missing
                .iter()
                .map(|p| if p.display_name.is_empty() { p.id.as_str() } else { p.display_name.as_str() })
                .collect();
            return Some(format!("external authentication required for {}", names.join(", ")));
        }
        None
    }

    pub fn can_submit(&self) -> bool {
        self.blocking_reason().is_none()
    }

    /// Client-side validation of the name and parameters.
    pub fn validate(&self) -> Result<(), FormError> {
        let mut errors: Vec<FieldError> = Vec::new();
        if let Err(e) = validation::validate_workspace_name(&self.name) {
            errors.push(e);
        }
        errors.extend(validation::validate_parameters(
            &self.session.parameters,
            &self.session.inputs,
            &self.last_build,
        ));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FormError::Invalid(errors))
        }
    }

    /// Produce the creation request if submission is allowed and valid.
    pub fn build_request(&self) -> Result<CreateWorkspaceRequest, FormError> {
        if let Some(reason) = self.blocking_reason() {
            return Err(FormError::Blocked(reason));
        }
        self.validate()?;
        if self.session.has_error_diagnostics() {
            return Err(FormError::Blocked("parameters have errors".to_string()));
        }

        let rich_parameter_values = self
            .fields()
            .into_iter()
            .map(|field| WorkspaceBuildParameter {
                name: field.parameter.name.clone(),
                value: field.value.to_string(),
            })
            .collect();

        Ok(CreateWorkspaceRequest {
            template_id: None,
            template_version_id: Some(self.version_id),
            name: self.name.clone(),
            rich_parameter_values,
            template_version_preset_id: self.presets.selected().map(|p| p.id),
        })
    }
}
