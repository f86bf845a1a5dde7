use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::dispatch::{Dispatcher, Sweeper};
use crate::error::Result;
use crate::gateway::{self, GatewayState};
use crate::identity::{KeyPair, PublicKey};
use crate::store::Store;

/// A controller process: signing key, store, dispatcher, background
/// loops and the API gateway.
pub struct ControllerNode {
    config: ControllerConfig,
    keys: KeyPair,
    dispatcher: Dispatcher,
}

impl ControllerNode {
    /// Load (or create) the signing key and open the store.
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        let keys = KeyPair::load_or_generate(&config.key_path).await?;
        Self::with_keys(config, keys).await
    }

    pub async fn with_keys(config: ControllerConfig, keys: KeyPair) -> Result<Self> {
        let store = match &config.state_path {
            Some(path) => Store::open(path, config.max_jobs, config.lock_timeout()).await?,
            None => Store::in_memory(config.max_jobs, config.lock_timeout()),
        };
        let dispatcher = Dispatcher::new(store, config.dispatch.clone());

        Ok(Self {
            config,
            keys,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public()
    }

    /// Bind the configured address and run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run on an already-bound listener.
    ///
    /// The background loops and the gateway share `shutdown`. The gateway
    /// drains in-flight requests first, then the loops are awaited.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if self.config.auth.allow_any_client {
            tracing::warn!("Accepting requests from any client key, do not use in production");
        } else if self.config.auth.authorized_clients.is_empty() {
            tracing::warn!("No authorized clients configured, only agents can use the API");
        }
        tracing::info!(
            public_key = %self.keys.public(),
            persistent = self.dispatcher.store().is_persistent(),
            "Controller starting"
        );

        let loops = Sweeper::new(
            self.dispatcher.clone(),
            self.config.sweep.clone(),
            shutdown.child_token(),
        )
        .spawn();

        let state = GatewayState::new(self.dispatcher.clone(), self.keys, self.config.auth.clone());
        let served = gateway::serve(listener, state, shutdown.clone()).await;

        // the gateway may have stopped on its own error
        shutdown.cancel();
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        tracing::info!("Controller stopped");
        served
    }
}
