//! Client delegate: the caller-supplied handlers for engine events
//!
//! Handlers run on the connection's read loop, one at a time and in wire
//! order. A handler that awaits something slow holds up every later
//! notification and response on that connection, so real work belongs on
//! another task (see `ForwardingDelegate`).

use super::notification::*;
use crate::error::{CloseReason, RemoteError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handlers for everything the engine sends unprompted.
///
/// Every method has a no-op default so implementors only write the ones
/// they care about.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientDelegate: Send + Sync {
    /// Line-cache update for a view
    async fn update(&self, _params: UpdateParams) {}

    async fn scroll_to(&self, _params: ScrollToParams) {}

    /// New style definition referenced by later updates
    async fn def_style(&self, _params: StyleDef) {}

    async fn theme_changed(&self, _params: ThemeChangedParams) {}

    async fn available_themes(&self, _params: AvailableThemesParams) {}

    async fn available_languages(&self, _params: AvailableLanguagesParams) {}

    async fn language_changed(&self, _params: LanguageChangedParams) {}

    async fn config_changed(&self, _params: ConfigChangedParams) {}

    async fn available_plugins(&self, _params: AvailablePluginsParams) {}

    async fn plugin_started(&self, _params: PluginStartedParams) {}

    async fn plugin_stopped(&self, _params: PluginStoppedParams) {}

    async fn update_cmds(&self, _params: UpdateCmdsParams) {}

    async fn add_status_item(&self, _params: AddStatusItemParams) {}

    async fn update_status_item(&self, _params: UpdateStatusItemParams) {}

    async fn remove_status_item(&self, _params: RemoveStatusItemParams) {}

    /// User-visible message from the engine
    async fn alert(&self, _params: AlertParams) {}

    async fn find_status(&self, _params: FindStatusParams) {}

    async fn replace_status(&self, _params: ReplaceStatusParams) {}

    async fn show_hover(&self, _params: ShowHoverParams) {}

    /// Notification whose method is not in the known vocabulary
    async fn unknown_notification(&self, _method: String, _params: Value) {}

    /// Measure rendered string widths, one result array per request entry
    async fn measure_width(
        &self,
        _requests: Vec<MeasureWidthRequest>,
    ) -> Result<Vec<Vec<f64>>, RemoteError> {
        Err(RemoteError::new(-32601, "measure_width is not supported"))
    }

    /// Called once when the connection reaches `Closed`
    async fn connection_closed(&self, _reason: CloseReason) {}
}

/// Route a decoded notification to its handler
pub async fn dispatch_notification(delegate: &dyn ClientDelegate, notification: EngineNotification) {
    match notification {
        EngineNotification::Update(p) => delegate.update(p).await,
        EngineNotification::ScrollTo(p) => delegate.scroll_to(p).await,
        EngineNotification::DefStyle(p) => delegate.def_style(p).await,
        EngineNotification::ThemeChanged(p) => delegate.theme_changed(p).await,
        EngineNotification::AvailableThemes(p) => delegate.available_themes(p).await,
        EngineNotification::AvailableLanguages(p) => delegate.available_languages(p).await,
        EngineNotification::LanguageChanged(p) => delegate.language_changed(p).await,
        EngineNotification::ConfigChanged(p) => delegate.config_changed(p).await,
        EngineNotification::AvailablePlugins(p) => delegate.available_plugins(p).await,
        EngineNotification::PluginStarted(p) => delegate.plugin_started(p).await,
        EngineNotification::PluginStopped(p) => delegate.plugin_stopped(p).await,
        EngineNotification::UpdateCmds(p) => delegate.update_cmds(p).await,
        EngineNotification::AddStatusItem(p) => delegate.add_status_item(p).await,
        EngineNotification::UpdateStatusItem(p) => delegate.update_status_item(p).await,
        EngineNotification::RemoveStatusItem(p) => delegate.remove_status_item(p).await,
        EngineNotification::Alert(p) => delegate.alert(p).await,
        EngineNotification::FindStatus(p) => delegate.find_status(p).await,
        EngineNotification::ReplaceStatus(p) => delegate.replace_status(p).await,
        EngineNotification::ShowHover(p) => delegate.show_hover(p).await,
        EngineNotification::Unknown { method, params } => {
            warn!("Dropping unknown notification: {}", method);
            delegate.unknown_notification(method, params).await
        }
    }
}

/// What `ForwardingDelegate` hands to its receiver
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateEvent {
    Notification(EngineNotification),
    Closed(CloseReason),
}

/// Delegate that pushes every event onto a channel and returns immediately.
///
/// Lets the UI consume engine events on its own task without stalling the
/// read loop.
pub struct ForwardingDelegate {
    tx: mpsc::UnboundedSender<DelegateEvent>,
}

impl ForwardingDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DelegateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: EngineNotification) {
        if self.tx.send(DelegateEvent::Notification(notification)).is_err() {
            debug!("Delegate receiver dropped, discarding notification");
        }
    }
}

#[async_trait]
impl ClientDelegate for ForwardingDelegate {
    async fn update(&self, params: UpdateParams) {
        self.forward(EngineNotification::Update(params));
    }

    async fn scroll_to(&self, params: ScrollToParams) {
        self.forward(EngineNotification::ScrollTo(params));
    }

    async fn def_style(&self, params: StyleDef) {
        self.forward(EngineNotification::DefStyle(params));
    }

    async fn theme_changed(&self, params: ThemeChangedParams) {
        self.forward(EngineNotification::ThemeChanged(params));
    }

    async fn available_themes(&self, params: AvailableThemesParams) {
        self.forward(EngineNotification::AvailableThemes(params));
    }

    async fn available_languages(&self, params: AvailableLanguagesParams) {
        self.forward(EngineNotification::AvailableLanguages(params));
    }

    async fn language_changed(&self, params: LanguageChangedParams) {
        self.forward(EngineNotification::LanguageChanged(params));
    }

    async fn config_changed(&self, params: ConfigChangedParams) {
        self.forward(EngineNotification::ConfigChanged(params));
    }

    async fn available_plugins(&self, params: AvailablePluginsParams) {
        self.forward(EngineNotification::AvailablePlugins(params));
    }

    async fn plugin_started(&self, params: PluginStartedParams) {
        self.forward(EngineNotification::PluginStarted(params));
    }

    async fn plugin_stopped(&self, params: PluginStoppedParams) {
        self.forward(EngineNotification::PluginStopped(params));
    }

    async fn update_cmds(&self, params: UpdateCmdsParams) {
        self.forward(EngineNotification::UpdateCmds(params));
    }

    async fn add_status_item(&self, params: AddStatusItemParams) {
        self.forward(EngineNotification::AddStatusItem(params));
    }

    async fn update_status_item(&self, params: UpdateStatusItemParams) {
        self.forward(EngineNotification::UpdateStatusItem(params));
    }

    async fn remove_status_item(&self, params: RemoveStatusItemParams) {
        self.forward(EngineNotification::RemoveStatusItem(params));
    }

    async fn alert(&self, params: AlertParams) {
        self.forward(EngineNotification::Alert(params));
    }

    async fn find_status(&self, params: FindStatusParams) {
        self.forward(EngineNotification::FindStatus(params));
    }

    async fn replace_status(&self, params: ReplaceStatusParams) {
        self.forward(EngineNotification::ReplaceStatus(params));
    }

    async fn show_hover(&self, params: ShowHoverParams) {
        self.forward(EngineNotification::ShowHover(params));
    }

    async fn unknown_notification(&self, method: String, params: Value) {
        self.forward(EngineNotification::Unknown { method, params });
    }

    async fn connection_closed(&self, reason: CloseReason) {
        let _ = self.tx.send(DelegateEvent::Closed(reason));
    }
}
