//! Typed engine API
//!
//! Thin wrappers over `Connection::send_request` / `send_notification` with
//! the parameter shapes the engine expects.

use crate::config::EngineConfig;
use crate::error::{CallError, Error, Result};
use crate::rpc::{ClientDelegate, Connection, ViewId};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Target of a `modify_user_config` change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigDomain {
    General,
    /// Settings for one language, e.g. `"rust"`
    Syntax(String),
    /// Overrides for a single view
    UserOverride(ViewId),
}

/// Front-end handle to a running engine
pub struct EngineClient {
    connection: Connection,
}

impl EngineClient {
    /// Spawn the engine and connect to it
    pub fn spawn(config: &EngineConfig, delegate: Arc<dyn ClientDelegate>) -> Result<Self> {
        Ok(Self::new(Connection::spawn(config, delegate)?))
    }

    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Handshake telling the engine where the client keeps its files
    pub fn client_started(
        &self,
        config_dir: Option<&Path>,
        client_extras_dir: Option<&Path>,
    ) -> Result<()> {
        let mut params = Map::new();
        if let Some(dir) = config_dir {
            params.insert("config_dir".into(), json!(dir.to_string_lossy()));
        }
        if let Some(dir) = client_extras_dir {
            params.insert("client_extras_dir".into(), json!(dir.to_string_lossy()));
        }
        self.connection
            .send_notification("client_started", Value::Object(params))
    }

    /// Open a view, optionally backed by a file. Resolves to the new view id.
    pub async fn new_view(&self, file_path: Option<&Path>) -> Result<ViewId> {
        let params = match file_path {
            Some(path) => json!({ "file_path": path.to_string_lossy() }),
            None => json!({}),
        };
        let view_id: ViewId = self.connection.call_as("new_view", params).await?;
        debug!("Opened view {}", view_id);
        Ok(view_id)
    }

    pub fn close_view(&self, view_id: &ViewId) -> Result<()> {
        self.connection
            .send_notification("close_view", json!({ "view_id": view_id }))
    }

    pub fn save(&self, view_id: &ViewId, file_path: &Path) -> Result<()> {
        self.connection.send_notification(
            "save",
            json!({ "view_id": view_id, "file_path": file_path.to_string_lossy() }),
        )
    }

    pub fn set_theme(&self, theme_name: &str) -> Result<()> {
        self.connection
            .send_notification("set_theme", json!({ "theme_name": theme_name }))
    }

    pub fn set_language(&self, view_id: &ViewId, language_id: &str) -> Result<()> {
        self.connection.send_notification(
            "set_language",
            json!({ "view_id": view_id, "language_id": language_id }),
        )
    }

    pub fn modify_user_config(&self, domain: ConfigDomain, changes: Value) -> Result<()> {
        self.connection.send_notification(
            "modify_user_config",
            json!({ "domain": domain, "changes": changes }),
        )
    }

    /// Effective configuration of a view
    pub async fn get_config(&self, view_id: &ViewId) -> Result<Map<String, Value>> {
        self.connection
            .call_as("get_config", json!({ "view_id": view_id }))
            .await
    }

    /// Pass-through edit command, fire and forget.
    ///
    /// Sent as `{"method":"edit","params":{"view_id","method","params"}}`.
    pub fn edit(&self, view_id: &ViewId, method: &str, params: Value) -> Result<()> {
        self.connection
            .send_notification("edit", edit_envelope(view_id, method, params))
    }

    /// Pass-through edit command that expects a result (e.g. `copy`)
    pub async fn edit_request(&self, view_id: &ViewId, method: &str, params: Value) -> Result<Value> {
        self.connection
            .call("edit", edit_envelope(view_id, method, params))
            .await
    }

    pub fn insert(&self, view_id: &ViewId, chars: &str) -> Result<()> {
        self.edit(view_id, "insert", json!({ "chars": chars }))
    }

    /// Report the visible line range `[first, last)`
    pub fn scroll(&self, view_id: &ViewId, first: usize, last: usize) -> Result<()> {
        self.edit(view_id, "scroll", json!([first, last]))
    }

    pub fn start_plugin(&self, view_id: &ViewId, plugin_name: &str) -> Result<()> {
        self.plugin_command("start", view_id, plugin_name)
    }

    pub fn stop_plugin(&self, view_id: &ViewId, plugin_name: &str) -> Result<()> {
        self.plugin_command("stop", view_id, plugin_name)
    }

    fn plugin_command(&self, command: &str, view_id: &ViewId, plugin_name: &str) -> Result<()> {
        self.connection.send_notification(
            "plugin",
            json!({ "command": command, "view_id": view_id, "plugin_name": plugin_name }),
        )
    }

    /// Close the connection and stop the engine
    pub async fn shutdown(&self) {
        self.connection.close().await;
    }
}

fn edit_envelope(view_id: &ViewId, method: &str, params: Value) -> Value {
    json!({ "view_id": view_id, "method": method, "params": params })
}

/// Counted wait over a known number of completions.
///
/// Hand clones to request callbacks, call `count_down` in each, and `wait`
/// with a timeout.
#[derive(Clone)]
pub struct CompletionLatch {
    remaining: Arc<watch::Sender<usize>>,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        let (tx, _) = watch::channel(count);
        Self {
            remaining: Arc::new(tx),
        }
    }

    /// Record one completion. Extra calls past zero are ignored.
    pub fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait for the count to reach zero, failing with `CallError::Timeout`
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.remaining.subscribe();
        let released = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        let outcome = match released {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::NotReady("latch dropped".to_string())),
            Err(_) => Err(Error::Call(CallError::Timeout)),
        };
        outcome
    }
}
