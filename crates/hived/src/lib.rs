//! hived - workflow orchestration daemon
//!
//! Library components for the daemon process.

pub mod bus;
pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod notify;
pub mod server;
pub mod storage;
pub mod triggers;

use std::sync::Arc;
use std::time::Duration;

use bus::{EventBus, Subscription};
use dispatch::{BackendChain, ExternalDispatcher};
use engine::Engine;
use eyre::WrapErr;
use gate::DispatchGate;
use hive_core::Config;
use notify::Notifier;
use server::AppState;
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::info;
use triggers::{TriggerLifecycle, TriggerSettings};

/// Daemon state.
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    bus: EventBus,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a daemon that reaches the external scheduler through the
    /// configured backend chain.
    pub async fn new(config: Config) -> eyre::Result<Self> {
        let dispatcher: Arc<dyn ExternalDispatcher> = Arc::new(BackendChain::from_config(&config));
        Self::with_dispatcher(config, dispatcher).await
    }

    /// Create a daemon with an explicit dispatcher.
    pub async fn with_dispatcher(
        config: Config,
        dispatcher: Arc<dyn ExternalDispatcher>,
    ) -> eyre::Result<Self> {
        let storage = Storage::new(&config.db_path)
            .await
            .wrap_err_with(|| format!("failed to open database {}", config.db_path.display()))?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to migrate database")?;
        let storage = Arc::new(storage);

        let bus = EventBus::new();
        let stale_after = chrono::Duration::seconds(
            i64::try_from(config.stale_after_sec).unwrap_or(i64::MAX / 1000),
        );
        let engine = Arc::new(Engine::new(Arc::clone(&storage), bus.clone(), stale_after));

        let gate = Arc::new(DispatchGate::new(
            Arc::clone(&storage),
            Arc::clone(&dispatcher),
            config.trigger_prefix.clone(),
            Duration::from_millis(config.dispatch_timeout_ms),
        ));
        let lifecycle = Arc::new(TriggerLifecycle::new(
            Arc::clone(&storage),
            dispatcher,
            config.workflows_dir.clone(),
            TriggerSettings::from_config(&config),
        ));
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&storage),
            Duration::from_millis(config.notify_timeout_ms),
        ));

        let subscriptions = vec![
            lifecycle.subscribe(&bus),
            gate.subscribe(&bus),
            notifier.subscribe(&bus),
        ];

        Ok(Self {
            config,
            storage,
            bus,
            engine,
            shutdown: CancellationToken::new(),
            subscriptions,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Shared state for the HTTP layer.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            storage: Arc::clone(&self.storage),
            workflows_dir: self.config.workflows_dir.clone(),
        })
    }

    /// Serve the HTTP API until [`Daemon::shutdown`] is called.
    pub async fn run(&self) -> eyre::Result<()> {
        info!("hived starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("workflows: {}", self.config.workflows_dir.display());

        server::start_server(self.app_state(), self.config.port, self.shutdown.clone())
            .await
            .wrap_err("HTTP server failed")?;

        info!("hived stopped");
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    /// Detach all bus listeners.
    pub fn unsubscribe_all(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}
