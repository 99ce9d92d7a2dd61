// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Startup and shutdown of the authenticator's subsystems.
//!
//! The [`Bootstrap`] is responsible for:
//! 1. Picking clients for the selected [`Mode`]
//! 2. Building the watch cache and everything that reads from it
//! 3. Running the controller and the webhook server together
//! 4. Tearing everything down when the cancellation token fires

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{Lister, WatchCache};
use crate::client::{ClientError, ClientFactory, ClientPair, KubeClientFactory};
use crate::config::AuthenticatorConfig;
use crate::controller::{Controller, ControllerError, MappingController};
use crate::feature::{FeatureGate, IAM_IDENTITY_MAPPING_CRD};
use crate::server::AuthServer;
use crate::token::TokenVerifier;

/// Relist period of the watch cache when mapping resources are served.
pub const FULL_RESYNC_PERIOD: Duration = Duration::from_secs(36_000);

/// Number of concurrent controller workers.
pub const CONTROLLER_WORKERS: usize = 2;

/// Which subsystems run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Mapping resources are read from the cluster and reconciled.
    Full,
    /// Only the webhook runs, over empty in-memory clients.
    Bypass,
}

impl Mode {
    /// Selects the mode from the `IAMIdentityMappingCRD` gate.
    pub fn from_feature_gate(gate: &dyn FeatureGate) -> Self {
        if gate.enabled(IAM_IDENTITY_MAPPING_CRD) {
            Mode::Full
        } else {
            Mode::Bypass
        }
    }

    /// Relist period for the watch cache in this mode. Zero disables it.
    pub fn resync_period(self) -> Duration {
        match self {
            Mode::Full => FULL_RESYNC_PERIOD,
            Mode::Bypass => Duration::ZERO,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Full => f.write_str("full"),
            Mode::Bypass => f.write_str("bypass"),
        }
    }
}

/// Fatal startup and runtime errors.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("failed to create kubernetes clients: {0}")]
    Connect(#[source] ClientError),

    #[error("controller failed: {0}")]
    Controller(#[source] ControllerError),

    #[error("failed to start webhook server: {0:#}")]
    Server(anyhow::Error),
}

/// Builds the controller from the clients and the cache it reads.
pub type ControllerConstructor =
    Arc<dyn Fn(&ClientPair, &WatchCache, Lister) -> Arc<dyn Controller> + Send + Sync>;

fn mapping_controller(clients: &ClientPair, cache: &WatchCache, lister: Lister) -> Arc<dyn Controller> {
    Arc::new(MappingController::new(clients.clone(), cache, lister))
}

/// Wires up and runs the authenticator.
pub struct Bootstrap {
    config: AuthenticatorConfig,
    mode: Mode,
    verifier: Arc<dyn TokenVerifier>,
    client_factory: Arc<dyn ClientFactory>,
    controller_constructor: ControllerConstructor,
    bypass_clients: Option<ClientPair>,
    bound_addr: Option<oneshot::Sender<SocketAddr>>,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bootstrap {
    /// Creates a bootstrap that connects with [`KubeClientFactory`] and runs
    /// a [`MappingController`].
    pub fn new(config: AuthenticatorConfig, mode: Mode, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            config,
            mode,
            verifier,
            client_factory: Arc::new(KubeClientFactory),
            controller_constructor: Arc::new(mapping_controller),
            bypass_clients: None,
            bound_addr: None,
        }
    }

    /// Replaces the factory used to connect in [`Mode::Full`].
    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = factory;
        self
    }

    /// Replaces how the controller is built in [`Mode::Full`].
    pub fn with_controller_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&ClientPair, &WatchCache, Lister) -> Arc<dyn Controller> + Send + Sync + 'static,
    {
        self.controller_constructor = Arc::new(constructor);
        self
    }

    /// Uses `clients` instead of empty ones in [`Mode::Bypass`].
    pub fn with_bypass_clients(mut self, clients: ClientPair) -> Self {
        self.bypass_clients = Some(clients);
        self
    }

    /// Reports the webhook's listening address once it is bound.
    pub fn notify_bound(mut self, sender: oneshot::Sender<SocketAddr>) -> Self {
        self.bound_addr = Some(sender);
        self
    }

    /// Returns the selected mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Runs until `cancel` fires or the controller fails.
    ///
    /// Connection failures are returned before anything is started. Once
    /// running, every background task is joined before this returns, each
    /// bounded by the configured shutdown timeout.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BootstrapError> {
        let mode = self.mode;
        tracing::info!(%mode, "starting iam-authenticator");

        let clients = match mode {
            Mode::Full => {
                tracing::info!(
                    in_cluster = self.config.connection.is_in_cluster(),
                    "connecting to kubernetes"
                );
                self.client_factory
                    .connect(&self.config.connection)
                    .await
                    .map_err(BootstrapError::Connect)?
            }
            Mode::Bypass => self.bypass_clients.unwrap_or_else(ClientPair::in_memory),
        };

        // Lets a controller failure stop the other tasks without touching
        // the caller's token.
        let tasks = cancel.child_token();

        let (cache, lister) = WatchCache::build(Arc::clone(&clients.mappings), mode.resync_period());
        let controller = match mode {
            Mode::Full => Some((self.controller_constructor)(&clients, &cache, lister.clone())),
            Mode::Bypass => None,
        };
        let server = AuthServer::new(&self.config, lister, self.verifier);

        let cache_task = cache.start(tasks.clone());

        let server = match server.bind().await {
            Ok(server) => server,
            Err(e) => {
                tasks.cancel();
                let deadline = Instant::now() + self.config.shutdown_timeout;
                join_task("identity mapping cache", cache_task, deadline).await;
                return Err(BootstrapError::Server(e));
            }
        };
        if let (Some(sender), Ok(addr)) = (self.bound_addr, server.local_addr()) {
            let _ = sender.send(addr);
        }
        let server_task = tokio::spawn(server.serve(tasks.clone()));

        let result = match controller {
            Some(controller) => {
                tracing::info!(
                    controller = controller.name(),
                    workers = CONTROLLER_WORKERS,
                    "starting controller"
                );
                controller
                    .run(CONTROLLER_WORKERS, tasks.clone())
                    .await
                    .map_err(BootstrapError::Controller)
            }
            None => {
                tasks.cancelled().await;
                Ok(())
            }
        };

        match &result {
            Ok(()) => tracing::info!("shutdown signal received, stopping"),
            Err(e) => tracing::error!(error = %e, "controller failed, stopping"),
        }
        tasks.cancel();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        if let Some(Err(e)) = join_task("webhook server", server_task, deadline).await {
            tracing::warn!(error = %e, "webhook server stopped with error");
        }
        join_task("identity mapping cache", cache_task, deadline).await;

        tracing::info!("iam-authenticator stopped");
        result
    }
}

/// Waits for `handle` until `deadline`, aborting it if the deadline passes.
async fn join_task<T>(name: &str, mut handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(output)) => {
            tracing::debug!(task = name, "task stopped");
            Some(output)
        }
        Ok(Err(e)) => {
            tracing::warn!(task = name, error = %e, "task failed");
            None
        }
        Err(_) => {
            tracing::warn!(task = name, "shutdown timeout reached, aborting task");
            handle.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::MemoryFeatureGate;

    #[test]
    fn test_mode_from_feature_gate() {
        let gate = MemoryFeatureGate::with_defaults();
        assert_eq!(Mode::from_feature_gate(&gate), Mode::Bypass);

        let gate = gate.with_override(IAM_IDENTITY_MAPPING_CRD, true).unwrap();
        assert_eq!(Mode::from_feature_gate(&gate), Mode::Full);
    }

    #[test]
    fn test_mode_resync_period() {
        assert_eq!(Mode::Full.resync_period(), Duration::from_secs(10 * 60 * 60));
        assert!(Mode::Bypass.resync_period().is_zero());
        assert_eq!(Mode::Bypass.to_string(), "bypass");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_task_aborts_after_deadline() {
        let handle = tokio::spawn(std::future::pending::<()>());
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(join_task("stuck", handle, deadline).await.is_none());
    }

    #[tokio::test]
    async fn test_join_task_returns_output() {
        let handle = tokio::spawn(async { 7 });
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(join_task("quick", handle, deadline).await, Some(7));
    }
}
