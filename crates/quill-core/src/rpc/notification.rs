//! Engine-initiated messages
//!
//! Every `method` the engine may send without an id is decoded into
//! `EngineNotification` right at the message boundary, so the dispatcher
//! routes on a closed enum instead of comparing strings. Names outside the
//! known vocabulary become `EngineNotification::Unknown`.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Engine-assigned identifier of an open view (e.g. `"view-id-1"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(pub String);

impl ViewId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ViewId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ViewId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Buffer updates
// ============================================================================

/// Kind of a line-cache update operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOpKind {
    Copy,
    Skip,
    Invalidate,
    Update,
    Ins,
}

/// One rendered line as sent by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Line {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ln: Option<usize>,
    #[serde(default)]
    pub cursor: Vec<usize>,
    /// Flattened `(offset, length, style_id)` triples
    #[serde(default)]
    pub styles: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp {
    pub op: UpdateOpKind,
    pub n: usize,
    #[serde(default)]
    pub ln: Option<usize>,
    #[serde(default)]
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferUpdate {
    #[serde(default)]
    pub ops: Vec<UpdateOp>,
    #[serde(default)]
    pub pristine: bool,
    #[serde(default)]
    pub annotations: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub view_id: ViewId,
    pub update: BufferUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollToParams {
    pub view_id: ViewId,
    pub line: usize,
    pub col: usize,
}

// ============================================================================
// Styles and themes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleDef {
    pub id: u64,
    #[serde(default)]
    pub fg_color: Option<u32>,
    #[serde(default)]
    pub bg_color: Option<u32>,
    #[serde(default)]
    pub weight: Option<u16>,
    #[serde(default)]
    pub italic: Option<bool>,
    #[serde(default)]
    pub underline: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeChangedParams {
    pub name: String,
    /// Theme settings, passed through untouched for the renderer
    #[serde(default)]
    pub theme: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableThemesParams {
    #[serde(default)]
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableLanguagesParams {
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageChangedParams {
    pub view_id: ViewId,
    pub language_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangedParams {
    pub view_id: ViewId,
    #[serde(default)]
    pub changes: serde_json::Map<String, Value>,
}

// ============================================================================
// Plugins
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescription {
    pub name: String,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailablePluginsParams {
    pub view_id: ViewId,
    #[serde(default)]
    pub plugins: Vec<PluginDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStartedParams {
    pub view_id: ViewId,
    pub plugin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStoppedParams {
    pub view_id: ViewId,
    pub plugin: String,
    #[serde(default)]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCmdsParams {
    pub view_id: ViewId,
    pub plugin: String,
    #[serde(default)]
    pub cmds: Vec<Value>,
}

// ============================================================================
// Status bar, alerts, find/replace, hover
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAlignment {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddStatusItemParams {
    pub view_id: ViewId,
    #[serde(default)]
    pub source: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub alignment: StatusAlignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusItemParams {
    pub view_id: ViewId,
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveStatusItemParams {
    pub view_id: ViewId,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertParams {
    #[serde(alias = "text")]
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindQueryStatus {
    pub id: u64,
    #[serde(default)]
    pub chars: Option<String>,
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    #[serde(default)]
    pub is_regex: Option<bool>,
    #[serde(default)]
    pub whole_words: Option<bool>,
    #[serde(default)]
    pub matches: usize,
    #[serde(default)]
    pub lines: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindStatusParams {
    pub view_id: ViewId,
    #[serde(default)]
    pub queries: Vec<FindQueryStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceStatusParams {
    pub view_id: ViewId,
    pub status: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowHoverParams {
    pub view_id: ViewId,
    pub request_id: u64,
    #[serde(default)]
    pub result: String,
}

// ============================================================================
// Notification enum
// ============================================================================

/// Every notification the engine is documented to send
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    Update(UpdateParams),
    ScrollTo(ScrollToParams),
    DefStyle(StyleDef),
    ThemeChanged(ThemeChangedParams),
    AvailableThemes(AvailableThemesParams),
    AvailableLanguages(AvailableLanguagesParams),
    LanguageChanged(LanguageChangedParams),
    ConfigChanged(ConfigChangedParams),
    AvailablePlugins(AvailablePluginsParams),
    PluginStarted(PluginStartedParams),
    PluginStopped(PluginStoppedParams),
    UpdateCmds(UpdateCmdsParams),
    AddStatusItem(AddStatusItemParams),
    UpdateStatusItem(UpdateStatusItemParams),
    RemoveStatusItem(RemoveStatusItemParams),
    Alert(AlertParams),
    FindStatus(FindStatusParams),
    ReplaceStatus(ReplaceStatusParams),
    ShowHover(ShowHoverParams),
    /// A method name outside the known vocabulary
    Unknown { method: String, params: Value },
}

impl EngineNotification {
    /// Decode a notification from its method name and raw params.
    pub fn decode(method: &str, params: Value) -> Result<Self, ProtocolError> {
        let notification = match method {
            "update" => Self::Update(params_as(method, params)?),
            "scroll_to" => Self::ScrollTo(params_as(method, params)?),
            "def_style" => Self::DefStyle(params_as(method, params)?),
            "theme_changed" => Self::ThemeChanged(params_as(method, params)?),
            "available_themes" => Self::AvailableThemes(params_as(method, params)?),
            "available_languages" => Self::AvailableLanguages(params_as(method, params)?),
            "language_changed" => Self::LanguageChanged(params_as(method, params)?),
            "config_changed" => Self::ConfigChanged(params_as(method, params)?),
            "available_plugins" => Self::AvailablePlugins(params_as(method, params)?),
            "plugin_started" => Self::PluginStarted(params_as(method, params)?),
            "plugin_stopped" => Self::PluginStopped(params_as(method, params)?),
            "update_cmds" => Self::UpdateCmds(params_as(method, params)?),
            "add_status_item" => Self::AddStatusItem(params_as(method, params)?),
            "update_status_item" => Self::UpdateStatusItem(params_as(method, params)?),
            "remove_status_item" => Self::RemoveStatusItem(params_as(method, params)?),
            "alert" => Self::Alert(params_as(method, params)?),
            "find_status" => Self::FindStatus(params_as(method, params)?),
            "replace_status" => Self::ReplaceStatus(params_as(method, params)?),
            "show_hover" => Self::ShowHover(params_as(method, params)?),
            other => Self::Unknown {
                method: other.to_string(),
                params,
            },
        };
        Ok(notification)
    }

    /// Wire name of this notification
    pub fn method(&self) -> &str {
        match self {
            Self::Update(_) => "update",
            Self::ScrollTo(_) => "scroll_to",
            Self::DefStyle(_) => "def_style",
            Self::ThemeChanged(_) => "theme_changed",
            Self::AvailableThemes(_) => "available_themes",
            Self::AvailableLanguages(_) => "available_languages",
            Self::LanguageChanged(_) => "language_changed",
            Self::ConfigChanged(_) => "config_changed",
            Self::AvailablePlugins(_) => "available_plugins",
            Self::PluginStarted(_) => "plugin_started",
            Self::PluginStopped(_) => "plugin_stopped",
            Self::UpdateCmds(_) => "update_cmds",
            Self::AddStatusItem(_) => "add_status_item",
            Self::UpdateStatusItem(_) => "update_status_item",
            Self::RemoveStatusItem(_) => "remove_status_item",
            Self::Alert(_) => "alert",
            Self::FindStatus(_) => "find_status",
            Self::ReplaceStatus(_) => "replace_status",
            Self::ShowHover(_) => "show_hover",
            Self::Unknown { method, .. } => method,
        }
    }
}

// ============================================================================
// Engine requests
// ============================================================================

/// Strings to measure in one style
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureWidthRequest {
    pub id: u64,
    pub strings: Vec<String>,
}

/// Calls the engine makes into the front-end that expect a reply
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    MeasureWidth(Vec<MeasureWidthRequest>),
    Unknown { method: String, params: Value },
}

impl EngineRequest {
    pub fn decode(method: &str, params: Value) -> Result<Self, ProtocolError> {
        match method {
            "measure_width" => Ok(Self::MeasureWidth(params_as(method, params)?)),
            other => Ok(Self::Unknown {
                method: other.to_string(),
                params,
            }),
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Self::MeasureWidth(_) => "measure_width",
            Self::Unknown { method, .. } => method,
        }
    }
}

fn params_as<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
