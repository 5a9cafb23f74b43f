//! Builders for the objects the harnesses serve.

use paramdeck_lib::api::{Preset, PresetParameter, Template, TemplateVersionExternalAuth, User};
use paramdeck_lib::protocol::{
    FormType, NullHclString, ParameterOption, ParameterStyling, ParameterType, PreviewParameter,
};
use uuid::Uuid;

/// A mutable string parameter rendered as a text input.
pub fn string_parameter(name: &str, value: &str) -> PreviewParameter {
    PreviewParameter {
        name: name.to_string(),
        display_name: String::new(),
        description: String::new(),
        param_type: ParameterType::String,
        form_type: FormType::Input,
        mutable: true,
        required: false,
        order: 0,
        ephemeral: false,
        value: NullHclString::known(value),
        default_value: NullHclString::known(value),
        icon: String::new(),
        options: Vec::new(),
        validations: Vec::new(),
        styling: ParameterStyling::default(),
        diagnostics: Vec::new(),
    }
}

/// A dropdown over `options`, currently set to `value`.
pub fn dropdown_parameter(name: &str, value: &str, options: &[&str]) -> PreviewParameter {
    PreviewParameter {
        form_type: FormType::Dropdown,
        options: options
            .iter()
            .map(|option| ParameterOption {
                name: option.to_string(),
                description: String::new(),
                value: NullHclString::known(*option),
                icon: String::new(),
            })
            .collect(),
        ..string_parameter(name, value)
    }
}

/// A number parameter rendered as a slider.
pub fn number_parameter(name: &str, value: i64) -> PreviewParameter {
    PreviewParameter {
        param_type: ParameterType::Number,
        form_type: FormType::Slider,
        ..string_parameter(name, &value.to_string())
    }
}

pub fn template(name: &str) -> Template {
    Template {
        id: Uuid::new_v4(),
        name: name.to_string(),
        display_name: String::new(),
        organization_id: Uuid::new_v4(),
        organization_name: "default".to_string(),
        active_version_id: Uuid::new_v4(),
        require_active_version: false,
    }
}

pub fn user(username: &str) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        name: String::new(),
        email: format!("{username}@example.com"),
    }
}

/// A required provider in the given state.
pub fn external_auth(id: &str, authenticated: bool) -> TemplateVersionExternalAuth {
    TemplateVersionExternalAuth {
        id: id.to_string(),
        provider_type: id.to_string(),
        display_name: id.to_string(),
        authenticate_url: format!("/external-auth/{id}"),
        authenticated,
        optional: false,
    }
}

pub fn preset(name: &str, values: &[(&str, &str)], default: bool) -> Preset {
    Preset {
        id: Uuid::new_v4(),
        name: name.to_string(),
        parameters: values
            .iter()
            .map(|(name, value)| PresetParameter {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
        default,
        description: String::new(),
    }
}
