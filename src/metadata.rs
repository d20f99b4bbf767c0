//! Canonical session-capability metadata.
//!
//! ACP exposes three overlapping capability surfaces: the modern
//! `configOptions` list and the legacy `modes` / `models` states. This
//! module folds whichever subset the agent advertises into one canonical
//! [`SessionMetadata`] record so nothing downstream ever has to reason
//! about both shapes.
//!
//! The fold always operates on the *whole* accumulated [`SessionSnapshot`]:
//! a category that no advertised surface mentions is removed from the
//! metadata, not left stale.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Config-option category carrying the operating-mode selector.
const CATEGORY_MODE: &str = "mode";
/// Config-option category carrying the model selector.
const CATEGORY_MODEL: &str = "model";
/// Config-option category carrying the thought-level selector.
const CATEGORY_THOUGHT_LEVEL: &str = "thought_level";

// ── Canonical record ─────────────────────────────────────────────────────────

/// One selectable entry in the canonical metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionEntry {
    /// Stable code sent back to the agent on selection.
    pub code: String,
    /// Display name.
    pub value: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Canonical snapshot of the agent's selectable capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Available models, when advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<OptionEntry>>,
    /// Code of the currently selected model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_model_code: Option<String>,
    /// Available operating modes, when advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operating_modes: Option<Vec<OptionEntry>>,
    /// Code of the currently selected operating mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_operating_mode_code: Option<String>,
    /// Available thought levels, when advertised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_levels: Option<Vec<OptionEntry>>,
    /// Code of the currently selected thought level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_thought_level_code: Option<String>,
}

// ── Accumulated raw state ────────────────────────────────────────────────────

/// Raw ACP capability surfaces accumulated from handshake and update events.
///
/// The runner owns one of these per session and re-projects it through
/// [`merge`] whenever any surface changes.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Latest `configOptions` payload (normalized to the bare array).
    pub config_options: Option<Value>,
    /// Latest legacy `modes` state payload.
    pub modes: Option<Value>,
    /// Latest legacy `models` state payload.
    pub models: Option<Value>,
    /// Bare current-mode id from a `current_mode_update` event.
    pub current_mode_id: Option<String>,
}

impl SessionSnapshot {
    /// Fold one capability event into the snapshot.
    ///
    /// Returns `true` when the event touched a surface (the caller should
    /// re-project), `false` for events this snapshot does not track.
    pub fn apply_event(&mut self, name: &str, payload: &Value) -> bool {
        match name {
            "config_options_update" => {
                self.config_options = normalize_config_options_payload(payload);
                true
            }
            "modes_update" => {
                self.modes = Some(payload.clone());
                true
            }
            "models_update" => {
                self.models = Some(payload.clone());
                true
            }
            "current_mode_update" => {
                self.current_mode_id = extract_current_mode_id(payload);
                true
            }
            _ => false,
        }
    }
}

// ── Raw payload shapes ───────────────────────────────────────────────────────

/// One advertised config option, possibly a selector with choices.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigOption {
    /// Option id, used for `setSessionConfigOption`.
    #[serde(default)]
    pub id: Option<String>,
    /// Option type; only `select` participates in the projection.
    #[serde(rename = "type")]
    pub option_type: String,
    /// Category; only `mode`, `model`, and `thought_level` participate.
    #[serde(default)]
    pub category: Option<String>,
    /// Currently selected value. Left loose because non-select options
    /// carry booleans or numbers here.
    #[serde(rename = "currentValue", default)]
    pub current_value: Option<Value>,
    /// Display name of the option itself.
    #[serde(default)]
    pub name: Option<String>,
    /// Available choices; groups nest one level deep.
    #[serde(default)]
    pub options: Vec<ConfigChoice>,
}

impl ConfigOption {
    fn current_value_str(&self) -> Option<String> {
        self.current_value
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

/// A selectable choice: either a leaf value or a named group of leaves.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConfigChoice {
    /// Group entry contributing its nested options.
    Group {
        /// Group label (ignored by the projection).
        #[serde(default)]
        name: Option<String>,
        /// Leaf options inside the group.
        options: Vec<ConfigLeaf>,
    },
    /// Plain selectable value.
    Leaf(ConfigLeaf),
}

/// A concrete selectable value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigLeaf {
    /// Wire value; becomes the canonical `code`.
    pub value: String,
    /// Display name; becomes the canonical `value`.
    pub name: String,
    /// Optional description, carried through.
    #[serde(default)]
    pub description: Option<String>,
}

/// Legacy `modes` state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModeState {
    /// Advertised operating modes.
    #[serde(rename = "availableModes")]
    pub available_modes: Vec<ModeEntry>,
    /// Currently selected mode id.
    #[serde(rename = "currentModeId", default)]
    pub current_mode_id: Option<String>,
}

/// One legacy mode entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModeEntry {
    /// Mode id; becomes the canonical `code`.
    pub id: String,
    /// Display name; becomes the canonical `value`.
    pub name: String,
    /// Optional description, carried through.
    #[serde(default)]
    pub description: Option<String>,
}

/// Legacy `models` state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelState {
    /// Advertised models.
    #[serde(rename = "availableModels")]
    pub available_models: Vec<ModelEntry>,
    /// Currently selected model id.
    #[serde(rename = "currentModelId", default)]
    pub current_model_id: Option<String>,
}

/// One legacy model entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelEntry {
    /// Model id; becomes the canonical `code`.
    #[serde(rename = "modelId")]
    pub model_id: String,
    /// Display name; becomes the canonical `value`.
    pub name: String,
}

// ── Extractors ───────────────────────────────────────────────────────────────

/// Extract config options from a payload that is either the bare array or
/// an object wrapping it as `{"configOptions": [...]}`.
///
/// Entries that do not deserialize (unknown shapes from older agents) are
/// skipped individually rather than failing the whole list.
#[must_use]
pub fn extract_config_options_from_payload(payload: &Value) -> Option<Vec<ConfigOption>> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(map) => map.get("configOptions")?.as_array()?,
        _ => return None,
    };
    Some(
        list.iter()
            .filter_map(|entry| serde_json::from_value::<ConfigOption>(entry.clone()).ok())
            .collect(),
    )
}

/// Validate and extract a legacy mode state; `None` when `availableModes`
/// is missing or malformed.
#[must_use]
pub fn extract_mode_state(payload: &Value) -> Option<ModeState> {
    serde_json::from_value(payload.clone()).ok()
}

/// Validate and extract a legacy model state; `None` when
/// `availableModels` is missing or malformed.
#[must_use]
pub fn extract_model_state(payload: &Value) -> Option<ModelState> {
    serde_json::from_value(payload.clone()).ok()
}

/// Normalize a `config_options_update` payload to the bare array form.
fn normalize_config_options_payload(payload: &Value) -> Option<Value> {
    match payload {
        Value::Array(_) => Some(payload.clone()),
        Value::Object(map) => map.get("configOptions").cloned(),
        _ => None,
    }
}

/// Pull the selected mode id out of a `current_mode_update` payload.
fn extract_current_mode_id(payload: &Value) -> Option<String> {
    match payload {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map
            .get("currentModeId")
            .or_else(|| map.get("modeId"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    }
}

// ── Projection ───────────────────────────────────────────────────────────────

/// Fold the accumulated snapshot into the canonical metadata.
///
/// Precedence per category:
///
/// 1. A `select` config option of the matching category wins outright.
/// 2. Otherwise the legacy surface (`modes` for mode, `models` for model;
///    thought level has no legacy form) fills in.
/// 3. A category absent from both sources is removed.
///
/// A bare `currentModeId` carried by the snapshot overrides the selected
/// operating-mode code last, whatever produced it.
#[must_use]
pub fn merge(prev: &SessionMetadata, snap: &SessionSnapshot) -> SessionMetadata {
    let mut next = prev.clone();

    let selectors: Vec<ConfigOption> = snap
        .config_options
        .as_ref()
        .and_then(extract_config_options_from_payload)
        .unwrap_or_default()
        .into_iter()
        .filter(|opt| {
            opt.option_type == "select"
                && matches!(
                    opt.category.as_deref(),
                    Some(CATEGORY_MODE | CATEGORY_MODEL | CATEGORY_THOUGHT_LEVEL)
                )
        })
        .collect();

    let selector = |category: &str| {
        selectors
            .iter()
            .find(|opt| opt.category.as_deref() == Some(category))
    };

    // Operating modes.
    if let Some(sel) = selector(CATEGORY_MODE) {
        next.operating_modes = Some(flatten_choices(sel));
        next.current_operating_mode_code = sel.current_value_str();
    } else if let Some(state) = snap.modes.as_ref().and_then(extract_mode_state) {
        next.operating_modes = Some(
            state
                .available_modes
                .into_iter()
                .map(|mode| OptionEntry {
                    code: mode.id,
                    value: mode.name,
                    description: mode.description,
                })
                .collect(),
        );
        next.current_operating_mode_code = state.current_mode_id;
    } else {
        next.operating_modes = None;
        next.current_operating_mode_code = None;
    }

    // Models.
    if let Some(sel) = selector(CATEGORY_MODEL) {
        next.models = Some(flatten_choices(sel));
        next.current_model_code = sel.current_value_str();
    } else if let Some(state) = snap.models.as_ref().and_then(extract_model_state) {
        next.models = Some(
            state
                .available_models
                .into_iter()
                .map(|model| OptionEntry {
                    code: model.model_id,
                    value: model.name,
                    description: None,
                })
                .collect(),
        );
        next.current_model_code = state.current_model_id;
    } else {
        next.models = None;
        next.current_model_code = None;
    }

    // Thought levels: configOptions is the only source.
    if let Some(sel) = selector(CATEGORY_THOUGHT_LEVEL) {
        next.thought_levels = Some(flatten_choices(sel));
        next.current_thought_level_code = sel.current_value_str();
    } else {
        next.thought_levels = None;
        next.current_thought_level_code = None;
    }

    // A bare current-mode id always wins last.
    if let Some(mode_id) = &snap.current_mode_id {
        next.current_operating_mode_code = Some(mode_id.clone());
    }

    next
}

/// Flatten a selector's choices; grouped entries contribute their nested
/// options in place.
pub(crate) fn flatten_choices(option: &ConfigOption) -> Vec<OptionEntry> {
    let mut entries = Vec::new();
    for choice in &option.options {
        match choice {
            ConfigChoice::Leaf(leaf) => entries.push(leaf_entry(leaf)),
            ConfigChoice::Group { options, .. } => {
                entries.extend(options.iter().map(leaf_entry));
            }
        }
    }
    entries
}

fn leaf_entry(leaf: &ConfigLeaf) -> OptionEntry {
    OptionEntry {
        code: leaf.value.clone(),
        value: leaf.name.clone(),
        description: leaf.description.clone(),
    }
}
