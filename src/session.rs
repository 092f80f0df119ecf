//! Wires the engine for one CLI invocation: SQLite store, built-in
//! providers, HTTP transport and (when needed) the callback listener.

use anyhow::{Context, Result};
use journal::SqliteStore;
use orchestrator::{Engine, EngineOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use webhook::{CallbackListener, HttpTransport, ListenerHandle};

use crate::config::Config;
use crate::providers;

/// Overrides given on the command line
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub jobs: Option<usize>,
}

pub struct Session {
    pub engine: Engine,
    store: Arc<SqliteStore>,
    config: Config,
    listener: Option<ListenerHandle>,
}

impl Session {
    pub fn open(config: Config, overrides: &Overrides) -> Result<Self> {
        let db_path = match &overrides.database {
            Some(path) => path.clone(),
            None => config.database_path()?,
        };
        let store = Arc::new(
            SqliteStore::open(&db_path).with_context(|| format!("Could not open state at {}", db_path.display()))?,
        );
        log::debug!("Using state database {}", db_path.display());

        let ledger_dir = db_path
            .parent()
            .map_or_else(|| PathBuf::from("providers"), |p| p.join("providers"));
        let registry = providers::builtin(&ledger_dir)
            .with_context(|| format!("Could not open provider ledger at {}", ledger_dir.display()))?;

        let mut options: EngineOptions = config.engine_options();
        if let Some(jobs) = overrides.jobs {
            options.jobs = jobs.max(1);
        }
        options.response_url = match &config.callback.public_url {
            Some(url) => url.clone(),
            None => format!("http://{}/v1/callbacks", config.callback_bind()?),
        };

        let transport = Arc::new(HttpTransport::new(Duration::from_secs(30)));
        let engine = Engine::new(store.clone(), registry, options)?.with_transport(transport);

        Ok(Self {
            engine,
            store,
            config,
            listener: None,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Start the callback endpoint if it is not running yet
    pub fn listen_for_callbacks(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let bind = self.config.callback_bind()?;
        let handle = CallbackListener::start(bind, self.engine.gateway())
            .context("Custom resources need the callback endpoint")?;
        log::info!("Custom providers answer on {}", self.engine.options().response_url);
        self.listener = Some(handle);
        Ok(())
    }
}
