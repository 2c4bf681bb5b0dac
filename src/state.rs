use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::AppResult;
use crate::events::EventBroadcaster;
use crate::github::GitHubClient;
use crate::models::{Command, CommandResult, Node};
use crate::oauth::StateStore;
use crate::provider::Provider;
use crate::registry::Registries;

/// Routes a dispatched command to its target node. The default deployment
/// has none attached and the dispatch endpoint simulates a success result;
/// a real dispatcher (e.g. transport-pool backed) is plugged in here.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, node: &Node, command: &Command) -> AppResult<CommandResult>;
}

/// Process-wide dependencies injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registries: Registries,
    pub broadcaster: Arc<EventBroadcaster>,
    pub oauth_states: Arc<StateStore>,
    pub github: Arc<GitHubClient>,
    pub provider: Option<Arc<dyn Provider>>,
    pub dispatcher: Option<Arc<dyn CommandDispatcher>>,
    pub command_tx: mpsc::Sender<CommandResult>,
    pub shutdown: watch::Receiver<bool>,
    pub pool: Option<SqlitePool>,
    pub workspace_root: PathBuf,
}

impl AppState {
    /// State over in-memory registries with no provider or dispatcher
    /// attached. Used by tests and ephemeral runs.
    pub fn ephemeral(config: Config) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.websocket.buffer_size));
        let (command_tx, command_rx) = mpsc::channel(32);
        crate::events::start_command_relay(Arc::clone(&broadcaster), command_rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let workspace_root = PathBuf::from(&config.registry.workspace_root);
        Self {
            config: Arc::new(config),
            registries: Registries::memory(),
            broadcaster,
            oauth_states: Arc::new(StateStore::default()),
            github: Arc::new(GitHubClient::from_env()),
            provider: None,
            dispatcher: None,
            command_tx,
            shutdown: shutdown_rx,
            pool: None,
            workspace_root,
        }
    }
}
