//! Preset selection.
//!
//! A preset fixes the values of some parameters. While one is selected those
//! parameters are locked in the form.

use uuid::Uuid;

use crate::api::Preset;
use crate::error::ClientError;
use crate::protocol::{Inputs, PreviewParameter};

/// Label of the entry that selects no preset.
pub const NO_PRESET_LABEL: &str = "None";

/// One entry of the preset picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetOption {
    pub label: String,
    /// `None` for the "no preset" entry.
    pub id: Option<Uuid>,
}

/// The presets of a template version and which one is chosen.
#[derive(Debug, Clone, Default)]
pub struct PresetSelection {
    presets: Vec<Preset>,
    selected: Option<usize>,
}

impl PresetSelection {
    /// Starts on the template's default preset, if it declares one.
    pub fn new(presets: Vec<Preset>) -> Self {
        let selected = presets.iter().position(|p| p.default);
        Self { presets, selected }
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    /// Picker entries, "None" first.
    pub fn options(&self) -> Vec<PresetOption> {
        std::iter::once(PresetOption {
            label: NO_PRESET_LABEL.to_string(),
            id: None,
        })
        .chain(self.presets.iter().map(|p| PresetOption {
            label: p.name.clone(),
            id: Some(p.id),
        }))
        .collect()
    }

    pub fn selected(&self) -> Option<&Preset> {
        self.selected.and_then(|i| self.presets.get(i))
    }

    /// Select by id, or clear with `None`.
    pub fn select(&mut self, id: Option<Uuid>) -> Result<(), ClientError> {
        self.selected = match id {
            None => None,
            Some(id) => Some(
                self.presets
                    .iter()
                    .position(|p| p.id == id)
                    .ok_or_else(|| ClientError::NotFound(format!("preset {id} not found")))?,
            ),
        };
        Ok(())
    }

    /// Select by display name. "None" clears the selection.
    pub fn select_by_name(&mut self, name: &str) -> Result<(), ClientError> {
        if name.eq_ignore_ascii_case(NO_PRESET_LABEL) {
            self.selected = None;
            return Ok(());
        }
        let index = self
            .presets
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ClientError::NotFound(format!("preset {name:?} not found")))?;
        self.selected = Some(index);
        Ok(())
    }

    /// Whether the selected preset fixes `parameter`.
    pub fn is_locked(&self, parameter: &str) -> bool {
        self.selected()
            .is_some_and(|p| p.parameters.iter().any(|pp| pp.name == parameter))
    }

    /// Names fixed by the selected preset.
    pub fn locked_names(&self) -> Vec<&str> {
        self.selected()
            .map(|p| p.parameters.iter().map(|pp| pp.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Write the selected preset's values into `inputs` for parameters that
    /// exist in `parameters`. Returns whether anything changed.
    pub fn apply(&self, parameters: &[PreviewParameter], inputs: &mut Inputs) -> bool {
        let Some(preset) = self.selected() else {
            return false;
        };

        let mut changed = false;
        for value in &preset.parameters {
            if !parameters.iter().any(|p| p.name == value.name) {
                continue;
            }
            if inputs.get(&value.name) != Some(&value.value) {
                inputs.insert(value.name.clone(), value.value.clone());
                changed = true;
            }
        }
        changed
    }
}
