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

//! Controller trait and the identity mapping controller.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use futures::StreamExt;
use kube::runtime::controller::{self as runtime, Action};
use kube::runtime::events::EventType;
use kube::runtime::watcher;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

pub use tokio_util::sync::CancellationToken;

use crate::cache::{Lister, WatchCache};
use crate::client::{ClientError, ClientPair};
use crate::mapping::{self, IAMIdentityMapping, IAMIdentityMappingStatus};

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("controller {name}: cache change stream closed")]
    CacheClosed { name: String },

    #[error("controller {name} runtime error: {source}")]
    Runtime {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// A long-running reconciliation loop.
///
/// # Lifecycle
///
/// 1. The controller is constructed against a cache lister.
/// 2. [`Controller::run`] is called with a worker count and a cancellation token.
/// 3. It blocks until the token is cancelled, returning `Ok(())`, or until
///    something fails that it cannot recover from, returning `Err`.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    fn name(&self) -> &str;

    /// Runs the controller with `workers` concurrent workers.
    ///
    /// When `cancel` fires, in-flight work is allowed to finish and the
    /// method returns `Ok(())`.
    async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()>;
}

/// A wrapper that converts a function into a [`Controller`].
pub struct FunctionController<F, Fut>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    name: String,
    run_fn: F,
}

impl<F, Fut> FunctionController<F, Fut>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    /// Creates a new function-based controller.
    pub fn new(name: impl Into<String>, run_fn: F) -> Self {
        Self {
            name: name.into(),
            run_fn,
        }
    }
}

impl<F, Fut> fmt::Debug for FunctionController<F, Fut>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionController")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Controller for FunctionController<F, Fut>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()> {
        (self.run_fn)(workers, cancel).await
    }
}

/// Errors from a single reconcile.
#[derive(Error, Debug)]
enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Keeps `status` of each `IAMIdentityMapping` in line with its `spec`.
///
/// Runs on the kube runtime controller. Objects are read from the cache's
/// reflector store and reconciles are triggered by the cache's change
/// notifications, so the controller opens no watch of its own.
pub struct MappingController {
    context: Arc<Context>,
    changes: Mutex<Option<broadcast::Receiver<String>>>,
}

struct Context {
    clients: ClientPair,
    lister: Lister,
    failures: std::sync::Mutex<HashMap<String, u32>>,
}

impl fmt::Debug for MappingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingController")
            .field("retrying", &self.context.failures().len())
            .finish_non_exhaustive()
    }
}

impl MappingController {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "iamidentitymapping";

    /// Retries per key before it is dropped.
    pub const MAX_RETRIES: u32 = 5;

    /// Backoff for the first retry of a key.
    pub const BASE_DELAY: Duration = Duration::from_millis(5);

    /// Backoff ceiling.
    pub const MAX_DELAY: Duration = Duration::from_secs(1000);

    /// Creates a controller fed by `cache`. Must be called before the cache
    /// is started.
    pub fn new(clients: ClientPair, cache: &WatchCache, lister: Lister) -> Self {
        Self {
            context: Arc::new(Context::new(clients, lister)),
            changes: Mutex::new(Some(cache.subscribe())),
        }
    }
}

#[async_trait]
impl Controller for MappingController {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()> {
        let changes = self
            .changes
            .lock()
            .await
            .take()
            .ok_or_else(|| ControllerError::StartFailed {
                name: Self::NAME.to_string(),
                reason: "controller is already running".to_string(),
            })?;

        let lister = &self.context.lister;
        tracing::info!(controller = Self::NAME, "waiting for identity mapping cache to sync");
        if !lister.wait_for_sync(&cancel).await {
            if cancel.is_cancelled() {
                tracing::info!(controller = Self::NAME, "cancelled before cache sync");
                return Ok(());
            }
            return Err(ControllerError::CacheClosed {
                name: Self::NAME.to_string(),
            });
        }

        let initial: Vec<_> = lister.list().into_iter().map(Arc::unwrap_or_clone).collect();
        let trigger = stream::iter(initial.into_iter().map(Ok))
            .chain(changed_objects(changes, Arc::clone(&self.context)));

        let config = runtime::Config::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX));
        let shutdown = cancel.clone();

        tracing::info!(controller = Self::NAME, workers, "starting workers");
        runtime::Controller::for_stream(trigger, lister.store())
            .with_config(config)
            .graceful_shutdown_on(async move { shutdown.cancelled().await })
            .run(reconcile, error_policy, Arc::clone(&self.context))
            .for_each(|result| async move {
                match result {
                    Ok((object, _)) => tracing::debug!(mapping = %object.name, "identity mapping reconciled"),
                    // Already logged by the error policy.
                    Err(runtime::Error::ReconcilerFailed(_, _)) => {}
                    Err(e) => tracing::debug!(controller = Self::NAME, error = %e, "identity mapping not reconciled"),
                }
            })
            .await;

        // The runtime also stops when the change stream ends, which only
        // happens early if the cache stopped on its own.
        if !cancel.is_cancelled() {
            return Err(ControllerError::CacheClosed {
                name: Self::NAME.to_string(),
            });
        }

        tracing::info!(controller = Self::NAME, "controller stopped");
        Ok(())
    }
}

/// Turns cache change notifications into the objects to reconcile.
///
/// Names that are no longer in the cache are skipped. A lagged receiver
/// requeues the whole collection. The stream ends when the cache stops.
fn changed_objects(
    changes: broadcast::Receiver<String>,
    context: Arc<Context>,
) -> impl Stream<Item = std::result::Result<IAMIdentityMapping, watcher::Error>> + Send + 'static {
    stream::unfold((changes, context), |(mut changes, context)| async move {
        let batch: Vec<_> = match changes.recv().await {
            Ok(name) => match context.lister.get(&name) {
                Some(mapping) => vec![Arc::unwrap_or_clone(mapping)],
                None => {
                    context.forget(&name);
                    Vec::new()
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(controller = MappingController::NAME, missed, "fell behind cache changes, requeueing everything");
                context
                    .lister
                    .list()
                    .into_iter()
                    .map(Arc::unwrap_or_clone)
                    .collect()
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        Some((stream::iter(batch.into_iter().map(Ok)), (changes, context)))
    })
    .flatten()
}

async fn reconcile(
    mapping: Arc<IAMIdentityMapping>,
    context: Arc<Context>,
) -> std::result::Result<Action, ReconcileError> {
    let key = mapping.key();

    let canonical_arn = match mapping::canonicalize(&mapping.spec.arn) {
        Ok(arn) => arn,
        Err(e) => {
            // Retrying cannot fix the spec.
            tracing::warn!(mapping = %key, error = %e, "identity mapping has an invalid ARN");
            context
                .record(&mapping, EventType::Warning, "InvalidARN", &e.to_string())
                .await;
            context.forget(&key);
            return Ok(Action::await_change());
        }
    };

    let desired = IAMIdentityMappingStatus {
        user_id: Some(mapping::user_id(&canonical_arn)),
        canonical_arn: Some(canonical_arn),
    };
    if mapping.status.as_ref() != Some(&desired) {
        context.clients.mappings.update_status(&key, &desired).await?;
        tracing::info!(mapping = %key, canonical_arn = ?desired.canonical_arn, "identity mapping synced");
        context
            .record(
                &mapping,
                EventType::Normal,
                "Synced",
                "IAMIdentityMapping synced successfully",
            )
            .await;
    }

    context.forget(&key);
    Ok(Action::await_change())
}

fn error_policy(mapping: Arc<IAMIdentityMapping>, error: &ReconcileError, context: Arc<Context>) -> Action {
    let key = mapping.key();
    let failures = context.record_failure(&key);

    if failures > MappingController::MAX_RETRIES {
        tracing::error!(mapping = %key, error = %error, "dropping identity mapping after repeated failures");
        context.forget(&key);
        return Action::await_change();
    }

    let delay = backoff(failures);
    tracing::warn!(mapping = %key, error = %error, failures, ?delay, "failed to sync identity mapping, requeueing");
    Action::requeue(delay)
}

/// Jittered exponential backoff for the `failures`th retry.
fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let delay = MappingController::BASE_DELAY
        .saturating_mul(1u32 << exp)
        .min(MappingController::MAX_DELAY);
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    delay.mul_f64(1.0 + jitter)
}

impl Context {
    fn new(clients: ClientPair, lister: Lister) -> Self {
        Self {
            clients,
            lister,
            failures: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self.failures();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, key: &str) {
        self.failures().remove(key);
    }

    async fn record(&self, mapping: &IAMIdentityMapping, type_: EventType, reason: &str, message: &str) {
        if let Err(e) = self
            .clients
            .cluster
            .record_event(mapping, type_, reason, message)
            .await
        {
            tracing::warn!(mapping = %mapping.key(), error = %e, "failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryClusterClient, InMemoryMappingClient};
    use crate::mapping::IAMIdentityMappingSpec;

    fn mapping(name: &str, arn: &str) -> IAMIdentityMapping {
        IAMIdentityMapping::new(
            name,
            IAMIdentityMappingSpec {
                arn: arn.to_string(),
                username: name.to_string(),
                groups: vec![],
            },
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_function_controller_name() {
        let controller = FunctionController::new("test", |_, _| async { Ok(()) });
        assert_eq!(controller.name(), "test");
    }

    #[tokio::test]
    async fn test_function_controller_receives_workers() {
        let controller = FunctionController::new("test", |workers, _| async move {
            assert_eq!(workers, 2);
            Ok(())
        });
        controller.run(2, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mapping_controller_syncs_status() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let cluster = Arc::new(InMemoryClusterClient::new());
        mappings.apply(mapping(
            "admin",
            "arn:aws:sts::123456789012:assumed-role/Admin/alice",
        ));
        mappings.apply(mapping("broken", "not-an-arn"));

        let clients = ClientPair::new(cluster.clone(), mappings.clone());
        let (cache, lister) = WatchCache::build(mappings.clone(), Duration::ZERO);
        let controller = Arc::new(MappingController::new(clients, &cache, lister));

        let cancel = CancellationToken::new();
        let cache_task = cache.start(cancel.clone());
        let run = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(2, cancel).await })
        };

        eventually(|| {
            mappings
                .get("admin")
                .and_then(|m| m.status)
                .and_then(|s| s.canonical_arn)
                .as_deref()
                == Some("arn:aws:iam::123456789012:role/Admin")
        })
        .await;

        // Mappings created later are picked up from the watch.
        mappings.apply(mapping("dev", "arn:aws:iam::123456789012:user/Dev"));
        eventually(|| mappings.get("dev").and_then(|m| m.status).is_some()).await;

        eventually(|| {
            cluster
                .recorded()
                .iter()
                .any(|e| e.object == "broken" && e.reason == "InvalidARN" && matches!(e.type_, EventType::Warning))
        })
        .await;
        assert!(mappings.get("broken").unwrap().status.is_none());

        cancel.cancel();
        assert!(run.await.unwrap().is_ok());
        cache_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_error_names_controller() {
        let controller = FunctionController::new("failing", |_, _| async {
            Err(ControllerError::Runtime {
                name: "failing".to_string(),
                source: "boom".into(),
            })
        });
        let err = controller.run(1, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "controller failing runtime error: boom");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff(1);
        assert!(first >= MappingController::BASE_DELAY);
        assert!(first <= MappingController::BASE_DELAY.mul_f64(1.1));

        let second = backoff(2);
        assert!(second >= MappingController::BASE_DELAY * 2);

        let capped = backoff(64);
        assert!(capped >= MappingController::MAX_DELAY);
        assert!(capped <= MappingController::MAX_DELAY.mul_f64(1.1));
    }

    #[tokio::test]
    async fn test_error_policy_drops_after_max_retries() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let clients = ClientPair::new(Arc::new(InMemoryClusterClient::new()), mappings.clone());
        let (_cache, lister) = WatchCache::build(mappings, Duration::ZERO);
        let context = Arc::new(Context::new(clients, lister));

        let admin = Arc::new(mapping("admin", "arn:aws:iam::123456789012:role/Admin"));
        let error = ReconcileError::Client(ClientError::NotFound("admin".to_string()));

        for _ in 0..MappingController::MAX_RETRIES {
            let action = error_policy(Arc::clone(&admin), &error, Arc::clone(&context));
            assert_ne!(action, Action::await_change());
        }
        assert_eq!(
            error_policy(Arc::clone(&admin), &error, Arc::clone(&context)),
            Action::await_change()
        );

        // The count starts over once a key is dropped.
        assert!(context.failures().is_empty());
        let action = error_policy(admin, &error, Arc::clone(&context));
        assert_ne!(action, Action::await_change());
        assert_eq!(context.failures().get("admin"), Some(&1));
    }

    #[tokio::test]
    async fn test_reconcile_clears_failures() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let cluster = Arc::new(InMemoryClusterClient::new());
        let admin = mapping("admin", "arn:aws:iam::123456789012:role/Admin");
        mappings.apply(admin.clone());

        let clients = ClientPair::new(cluster.clone(), mappings.clone());
        let (_cache, lister) = WatchCache::build(mappings.clone(), Duration::ZERO);
        let context = Arc::new(Context::new(clients, lister));
        context.record_failure("admin");

        let action = reconcile(Arc::new(admin), Arc::clone(&context)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(context.failures().is_empty());
        assert_eq!(
            mappings.get("admin").and_then(|m| m.status).and_then(|s| s.user_id),
            Some(mapping::user_id("arn:aws:iam::123456789012:role/Admin"))
        );

        let recorded = cluster.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(recorded[0].type_, EventType::Normal));
        assert_eq!(recorded[0].reason, "Synced");
    }

    #[tokio::test]
    async fn test_mapping_controller_cancelled_before_sync() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let clients = ClientPair::new(Arc::new(InMemoryClusterClient::new()), mappings.clone());
        let (cache, lister) = WatchCache::build(mappings, Duration::ZERO);
        let controller = MappingController::new(clients, &cache, lister);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(controller.run(2, cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_mapping_controller_cache_closed() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let clients = ClientPair::new(Arc::new(InMemoryClusterClient::new()), mappings.clone());
        let (cache, lister) = WatchCache::build(mappings, Duration::ZERO);
        let controller = MappingController::new(clients, &cache, lister);

        // The cache stops on its own token while the controller's stays live.
        let cache_cancel = CancellationToken::new();
        let cache_task = cache.start(cache_cancel.clone());
        let run_cancel = CancellationToken::new();
        let run = tokio::spawn(async move { controller.run(1, run_cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache_cancel.cancel();
        cache_task.await.unwrap();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(ControllerError::CacheClosed { .. })));
    }

    #[tokio::test]
    async fn test_mapping_controller_runs_once() {
        let mappings = Arc::new(InMemoryMappingClient::new());
        let clients = ClientPair::new(Arc::new(InMemoryClusterClient::new()), mappings.clone());
        let (cache, lister) = WatchCache::build(mappings, Duration::ZERO);
        let controller = MappingController::new(clients, &cache, lister);

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller.run(1, cancel.clone()).await.unwrap();
        assert!(matches!(
            controller.run(1, cancel).await,
            Err(ControllerError::StartFailed { .. })
        ));
    }
}
