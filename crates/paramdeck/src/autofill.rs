//! Out-of-band parameter values and initial form state.
//!
//! Autofill values come from several places (the user's previous builds, a
//! duplicated workspace, a YAML values file, a shared link, command-line
//! flags). They are merged with later sources winning, then combined with
//! the server's evaluated values the first time parameters are seen.

use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::protocol::{FormType, Inputs, PreviewParameter};

/// Query-string prefix marking a parameter value in a shared link.
pub const URL_PARAM_PREFIX: &str = "param.";

/// Where an autofill value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofillSource {
    UserHistory,
    /// Copied from the workspace being duplicated.
    Duplicate,
    ValuesFile,
    Url,
    Flag,
    /// Values the user already typed, carried across a reconnect.
    Form,
}

/// A value supplied outside the evaluation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutofillParameter {
    pub name: String,
    pub value: String,
    pub source: AutofillSource,
}

impl AutofillParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>, source: AutofillSource) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            source,
        }
    }
}

/// Extract `param.<name>=<value>` pairs from a link.
pub fn from_url(url: &Url) -> Vec<AutofillParameter> {
    url.query_pairs()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(URL_PARAM_PREFIX)?;
            if name.is_empty() {
                return None;
            }
            Some(AutofillParameter::new(name, value.into_owned(), AutofillSource::Url))
        })
        .collect()
}

/// Parse `name=value` flags. The value may itself contain `=`.
pub fn from_flags(pairs: &[String]) -> Result<Vec<AutofillParameter>, ClientError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => Ok(AutofillParameter::new(
                name.trim(),
                value,
                AutofillSource::Flag,
            )),
            _ => Err(ClientError::Config(format!(
                "invalid parameter {pair:?}, expected name=value"
            ))),
        })
        .collect()
}

/// Load a YAML mapping of parameter name to value.
///
/// Scalars become their string form; sequences become a JSON array string,
/// which is how `list(string)` parameters are encoded.
pub fn from_values_file(path: &Path) -> Result<Vec<AutofillParameter>, ClientError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClientError::ValuesFile(format!("{}: {e}", path.display())))?;
    parse_values_yaml(&content).map_err(|e| ClientError::ValuesFile(format!("{}: {e}", path.display())))
}

fn parse_values_yaml(content: &str) -> Result<Vec<AutofillParameter>, String> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(content).map_err(|e| e.to_string())?;

    let mut values = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            serde_yaml::Value::String(name) => name,
            other => return Err(format!("parameter names must be strings, got {other:?}")),
        };
        let value = yaml_to_string(&name, value)?;
        values.push(AutofillParameter::new(name, value, AutofillSource::ValuesFile));
    }
    Ok(values)
}

fn yaml_to_string(name: &str, value: serde_yaml::Value) -> Result<String, String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::Sequence(items) => {
            let items = items
                .into_iter()
                .map(|item| yaml_to_string(name, item))
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::to_string(&items).map_err(|e| e.to_string())
        }
        serde_yaml::Value::Mapping(_) | serde_yaml::Value::Tagged(_) => {
            Err(format!("value for {name:?} must be a scalar or a list"))
        }
    }
}

/// Merge sources so that, per name, the highest-precedence value wins.
/// First-seen order of names is preserved.
pub fn merge(sources: impl IntoIterator<Item = AutofillParameter>) -> Vec<AutofillParameter> {
    let mut merged: Vec<AutofillParameter> = Vec::new();
    for param in sources {
        match merged.iter_mut().find(|p| p.name == param.name) {
            Some(existing) if param.source >= existing.source => *existing = param,
            Some(_) => {}
            None => merged.push(param),
        }
    }
    merged
}

/// Compute the first form state for a freshly evaluated parameter set.
///
/// Each parameter starts from the server's value. A non-empty autofill value
/// replaces it when it is acceptable for the parameter's options. Ephemeral
/// parameters always start from the server's value.
pub fn initial_values(parameters: &[PreviewParameter], autofill: &[AutofillParameter]) -> Inputs {
    parameters
        .iter()
        .map(|parameter| {
            let server_value = parameter.value.valid_value().to_string();
            if parameter.ephemeral {
                return (parameter.name.clone(), server_value);
            }

            let value = autofill
                .iter()
                .find(|a| a.name == parameter.name)
                .filter(|a| !a.value.is_empty() && is_valid_option(parameter, &a.value))
                .map(|a| a.value.clone())
                .unwrap_or(server_value);

            (parameter.name.clone(), value)
        })
        .collect()
}

/// Whether `value` can be offered to `parameter` without the server
/// rejecting it outright.
pub fn is_valid_option(parameter: &PreviewParameter, value: &str) -> bool {
    if parameter.form_type == FormType::MultiSelect {
        let Ok(selected) = serde_json::from_str::<Vec<String>>(value) else {
            return false;
        };
        return !parameter.options.is_empty() && selected.iter().any(|v| parameter.has_option(v));
    }

    if !parameter.options.is_empty() {
        return parameter.has_option(value);
    }

    true
}
