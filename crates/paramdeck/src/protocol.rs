//! Wire types for the dynamic parameter evaluation channel.
//!
//! The backend owns this format: the client sends the full form state as
//! [`DynamicParametersRequest`] and receives complete snapshots as
//! [`DynamicParametersResponse`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Full form state, parameter name to string value.
pub type Inputs = BTreeMap<String, String>;

/// Message sent from the client to the evaluation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicParametersRequest {
    /// Monotonic per connection.
    pub id: i64,
    pub owner_id: String,
    pub inputs: Inputs,
}

/// Snapshot sent from the evaluation service to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicParametersResponse {
    pub id: i64,
    #[serde(default)]
    pub parameters: Vec<PreviewParameter>,
    /// Diagnostics not tied to a single parameter.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "list(string)")]
    ListString,
}

impl ParameterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Bool => "bool",
            ParameterType::ListString => "list(string)",
        }
    }
}

/// Widget the template author asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormType {
    Radio,
    Slider,
    #[default]
    Input,
    Dropdown,
    Checkbox,
    Switch,
    MultiSelect,
    TagSelect,
    Textarea,
    Error,
    #[serde(other)]
    Unknown,
}

impl FormType {
    /// Free-text widgets whose edits are debounced before sending.
    pub fn is_free_text(self) -> bool {
        matches!(self, FormType::Input | FormType::Textarea)
    }
}

/// A string that may be unknown at evaluation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullHclString {
    pub value: String,
    pub valid: bool,
}

impl NullHclString {
    /// A known value.
    pub fn known(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            valid: true,
        }
    }

    /// The value, or the empty string when unknown.
    pub fn valid_value(&self) -> &str {
        if self.valid {
            &self.value
        } else {
            ""
        }
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticExtra {
    #[serde(default)]
    pub code: String,
}

/// A server-computed validation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub extra: DiagnosticExtra,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub value: NullHclString,
    #[serde(default)]
    pub icon: String,
}

/// Validation block declared on a parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValidation {
    #[serde(default)]
    pub validation_error: String,
    #[serde(default)]
    pub validation_regex: Option<String>,
    #[serde(default)]
    pub validation_min: Option<i64>,
    #[serde(default)]
    pub validation_max: Option<i64>,
    #[serde(default)]
    pub validation_monotonic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterStyling {
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
}

/// One configurable input of a template version, as evaluated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewParameter {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub form_type: FormType,
    #[serde(default)]
    pub mutable: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub ephemeral: bool,
    pub value: NullHclString,
    #[serde(default)]
    pub default_value: NullHclString,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub options: Vec<ParameterOption>,
    #[serde(default)]
    pub validations: Vec<ParameterValidation>,
    #[serde(default)]
    pub styling: ParameterStyling,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl PreviewParameter {
    /// Label shown to the user.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }

    /// True when the template author disabled the field.
    pub fn is_styled_disabled(&self) -> bool {
        self.styling.disabled.unwrap_or(false)
    }

    /// Whether `value` is one of the declared option values.
    pub fn has_option(&self, value: &str) -> bool {
        self.options.iter().any(|o| o.value.valid_value() == value)
    }

    /// Whether any error-severity diagnostic is attached.
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}
