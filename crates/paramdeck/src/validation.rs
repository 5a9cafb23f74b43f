//! Client-side form validation.
//!
//! These checks only add to what the server reports through diagnostics;
//! they never hide a server diagnostic.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::{Inputs, ParameterType, PreviewParameter};

/// Longest accepted workspace name.
pub const MAX_WORKSPACE_NAME_LEN: usize = 32;

/// Alphanumeric words joined by single hyphens.
pub const WORKSPACE_NAME_PATTERN: &str = r"^[a-zA-Z0-9]+(?:-[a-zA-Z0-9]+)*$";

/// Field name used for workspace name errors.
pub const NAME_FIELD: &str = "name";

/// A validation failure attached to one form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a workspace name.
pub fn validate_workspace_name(name: &str) -> Result<(), FieldError> {
    if name.is_empty() {
        return Err(FieldError::new(NAME_FIELD, "Please enter a workspace name."));
    }
    if name.chars().count() > MAX_WORKSPACE_NAME_LEN {
        return Err(FieldError::new(
            NAME_FIELD,
            format!("Workspace Name cannot be longer than {MAX_WORKSPACE_NAME_LEN} characters."),
        ));
    }
    let matches = Regex::new(WORKSPACE_NAME_PATTERN)
        .map(|re| re.is_match(name))
        .unwrap_or(false);
    if !matches {
        return Err(FieldError::new(NAME_FIELD, "Please enter a valid workspace name."));
    }
    Ok(())
}

/// Check one parameter value.
///
/// `last_build` is the value used by the workspace's previous build, which
/// monotonic rules compare against.
pub fn validate_parameter(
    parameter: &PreviewParameter,
    value: &str,
    last_build: Option<&str>,
) -> Result<(), FieldError> {
    let fail = |message: String| Err(FieldError::new(parameter.name.clone(), message));

    if parameter.required && value.is_empty() {
        return fail(format!("{} is required.", parameter.label()));
    }
    if value.is_empty() {
        return Ok(());
    }

    match parameter.param_type {
        ParameterType::Number => validate_number(parameter, value, last_build).or_else(fail),
        ParameterType::String => validate_pattern(parameter, value).or_else(fail),
        ParameterType::Bool | ParameterType::ListString => Ok(()),
    }
}

fn validate_number(parameter: &PreviewParameter, value: &str, last_build: Option<&str>) -> Result<(), String> {
    let min = parameter.validations.iter().find_map(|v| v.validation_min);
    let max = parameter.validations.iter().find_map(|v| v.validation_max);

    let Ok(number) = value.trim().parse::<f64>() else {
        return Err(custom_message(parameter, value).unwrap_or_else(|| "Value must be a number.".to_string()));
    };

    let out_of_range = match (min, max) {
        (Some(min), None) if number < min as f64 => Some(format!("Value must be greater than {min}.")),
        (None, Some(max)) if number > max as f64 => Some(format!("Value must be less than {max}.")),
        (Some(min), Some(max)) if number < min as f64 || number > max as f64 => {
            Some(format!("Value must be between {min} and {max}."))
        }
        _ => None,
    };
    if let Some(fallback) = out_of_range {
        return Err(custom_message(parameter, value).unwrap_or(fallback));
    }

    let monotonic = parameter
        .validations
        .iter()
        .filter_map(|v| v.validation_monotonic.as_deref())
        .find(|m| !m.is_empty());
    let previous = last_build.and_then(|last| last.trim().parse::<f64>().ok().map(|n| (last, n)));

    match (monotonic, previous) {
        (Some("increasing"), Some((last, previous))) if previous > number => {
            Err(format!("Value must only ever increase (last value was {last})"))
        }
        (Some("decreasing"), Some((last, previous))) if previous < number => {
            Err(format!("Value must only ever decrease (last value was {last})"))
        }
        _ => Ok(()),
    }
}

fn validate_pattern(parameter: &PreviewParameter, value: &str) -> Result<(), String> {
    let Some(pattern) = parameter
        .validations
        .iter()
        .filter_map(|v| v.validation_regex.as_deref())
        .find(|p| !p.is_empty())
    else {
        return Ok(());
    };

    // Patterns this engine cannot compile are left to the server.
    let Ok(re) = Regex::new(pattern) else {
        tracing::debug!(parameter = %parameter.name, pattern, "Skipping unsupported validation pattern");
        return Ok(());
    };

    if re.is_match(value) {
        return Ok(());
    }
    Err(custom_message(parameter, value).unwrap_or_else(|| format!("Value must match the pattern {pattern}.")))
}

/// The parameter's own error message with `{min}`, `{max}` and `{value}`
/// substituted.
fn custom_message(parameter: &PreviewParameter, value: &str) -> Option<String> {
    let template = parameter
        .validations
        .iter()
        .map(|v| v.validation_error.as_str())
        .find(|e| !e.is_empty())?;

    let min = parameter
        .validations
        .iter()
        .find_map(|v| v.validation_min)
        .map(|n| n.to_string())
        .unwrap_or_default();
    let max = parameter
        .validations
        .iter()
        .find_map(|v| v.validation_max)
        .map(|n| n.to_string())
        .unwrap_or_default();

    Some(
        template
            .replace("{min}", &min)
            .replace("{max}", &max)
            .replace("{value}", value),
    )
}

/// Validate every parameter against the current inputs.
pub fn validate_parameters(parameters: &[PreviewParameter], inputs: &Inputs, last_build: &Inputs) -> Vec<FieldError> {
    parameters
        .iter()
        .filter_map(|parameter| {
            let value = inputs.get(&parameter.name).map(String::as_str).unwrap_or("");
            let last = last_build.get(&parameter.name).map(String::as_str);
            validate_parameter(parameter, value, last).err()
        })
        .collect()
}
