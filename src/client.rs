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

//! API clients used by the cache and the controller.
//!
//! Both clients come in two flavours: one backed by a Kubernetes API server
//! and one held entirely in memory. The in-memory pair lets the webhook run
//! without a cluster and is what tests drive.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ConnectionConfig;
use crate::mapping::{IAMIdentityMapping, IAMIdentityMappingStatus};

/// Controller name reported on recorded events.
pub const EVENT_SOURCE: &str = "iam-authenticator";

/// Errors returned by the API clients.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{context}: {source}")]
    Config {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("identity mapping {0} not found")]
    NotFound(String),

    #[error("watch failed: {0}")]
    Watch(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    fn config(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ClientError::Config {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// A change observed on the identity mapping collection.
#[derive(Debug, Clone)]
pub enum MappingEvent {
    /// An object was created or modified.
    Applied(IAMIdentityMapping),
    /// An object was removed.
    Deleted(IAMIdentityMapping),
    /// The watch (re)started; this is the complete current collection.
    Restarted(Vec<IAMIdentityMapping>),
}

/// Typed client for `IAMIdentityMapping` resources.
#[async_trait]
pub trait IdentityMappingClient: Send + Sync + 'static {
    /// Lists every mapping.
    async fn list(&self) -> Result<Vec<IAMIdentityMapping>>;

    /// Streams changes. The first item is always [`MappingEvent::Restarted`].
    fn watch(&self) -> BoxStream<'static, Result<MappingEvent>>;

    /// Replaces the status of the named mapping.
    async fn update_status(&self, name: &str, status: &IAMIdentityMappingStatus) -> Result<()>;
}

/// Client for the cluster's built-in resources.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Records an event about a mapping.
    async fn record_event(
        &self,
        mapping: &IAMIdentityMapping,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}


/// The two clients every subsystem is wired with.
#[derive(Clone)]
pub struct ClientPair {
    /// Built-in resources.
    pub cluster: Arc<dyn ClusterClient>,
    /// Identity mapping resources.
    pub mappings: Arc<dyn IdentityMappingClient>,
}

impl ClientPair {
    /// Pairs two clients.
    pub fn new(cluster: Arc<dyn ClusterClient>, mappings: Arc<dyn IdentityMappingClient>) -> Self {
        Self { cluster, mappings }
    }

    /// Returns a pair of empty in-memory clients.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryClusterClient::new()),
            Arc::new(InMemoryMappingClient::new()),
        )
    }
}

impl std::fmt::Debug for ClientPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPair").finish_non_exhaustive()
    }
}

/// Builds the client pair for a connection.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Connects using `params`.
    async fn connect(&self, params: &ConnectionConfig) -> Result<ClientPair>;
}

/// Builds clients that talk to a Kubernetes API server.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, params: &ConnectionConfig) -> Result<ClientPair> {
        let config = kube_config(params).await?;
        let client = kube::Client::try_from(config)
            .map_err(|e| ClientError::config("can't create kubernetes client", e))?;

        Ok(ClientPair::new(
            Arc::new(KubeClusterClient::new(client.clone())),
            Arc::new(KubeMappingClient::new(client)),
        ))
    }
}

/// Resolves connection parameters to a client configuration.
///
/// An explicit kubeconfig wins, with `master` overriding its server URL.
/// A bare `master` is used without credentials. With neither set, the pod's
/// service account is used.
pub async fn kube_config(params: &ConnectionConfig) -> Result<kube::Config> {
    let master = params.master.as_deref().filter(|m| !m.is_empty());

    let mut config = if let Some(path) = &params.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            ClientError::config(format!("failed to read kubeconfig {}", path.display()), e)
        })?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                ClientError::config(format!("failed to load kubeconfig {}", path.display()), e)
            })?
    } else if let Some(master) = master {
        kube::Config::new(parse_master(master)?)
    } else {
        kube::Config::incluster()
            .map_err(|e| ClientError::config("can't create in-cluster kubernetes config", e))?
    };

    if let (Some(master), Some(_)) = (master, &params.kubeconfig) {
        config.cluster_url = parse_master(master)?;
    }

    Ok(config)
}

fn parse_master(master: &str) -> Result<http::Uri> {
    master
        .parse::<http::Uri>()
        .map_err(|e| ClientError::config(format!("invalid master URL {master}"), e))
}

/// `IAMIdentityMapping` client backed by the API server.
#[derive(Clone)]
pub struct KubeMappingClient {
    api: Api<IAMIdentityMapping>,
}

impl KubeMappingClient {
    /// Creates a client for cluster-scoped mappings.
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl IdentityMappingClient for KubeMappingClient {
    async fn list(&self) -> Result<Vec<IAMIdentityMapping>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    fn watch(&self) -> BoxStream<'static, Result<MappingEvent>> {
        let mut initial = Vec::new();

        watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let event = match event {
                    Ok(watcher::Event::Init) => {
                        initial.clear();
                        None
                    }
                    Ok(watcher::Event::InitApply(obj)) => {
                        initial.push(obj);
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        Some(Ok(MappingEvent::Restarted(std::mem::take(&mut initial))))
                    }
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(MappingEvent::Applied(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(MappingEvent::Deleted(obj))),
                    Err(e) => Some(Err(ClientError::Watch(e.to_string()))),
                };
                futures::future::ready(event)
            })
            .boxed()
    }

    async fn update_status(&self, name: &str, status: &IAMIdentityMappingStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Built-in resource client backed by the API server.
///
/// Events go through a kube [`Recorder`], which fills in the reporting
/// controller and timestamps and folds repeats of the same event into one
/// object.
#[derive(Clone)]
pub struct KubeClusterClient {
    recorder: Recorder,
}

impl KubeClusterClient {
    /// Action reported on every event.
    pub const EVENT_ACTION: &'static str = "Reconcile";

    /// Creates a client.
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: EVENT_SOURCE.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn record_event(
        &self,
        mapping: &IAMIdentityMapping,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: Self::EVENT_ACTION.to_string(),
            secondary: None,
        };

        self.recorder.publish(&event, &mapping.object_ref(&())).await?;
        Ok(())
    }
}

/// `IAMIdentityMapping` client that keeps objects in memory.
///
/// Writes are broadcast to open watches the same way the API server would
/// report them.
#[derive(Debug)]
pub struct InMemoryMappingClient {
    objects: RwLock<BTreeMap<String, IAMIdentityMapping>>,
    events: broadcast::Sender<MappingEvent>,
}

impl Default for InMemoryMappingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMappingClient {
    const WATCH_CAPACITY: usize = 256;

    /// Creates an empty client.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(Self::WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Creates or replaces a mapping.
    pub fn apply(&self, mapping: IAMIdentityMapping) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mapping.name_any(), mapping.clone());
        let _ = self.events.send(MappingEvent::Applied(mapping));
    }

    /// Removes a mapping. Returns false if it did not exist.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        match removed {
            Some(mapping) => {
                let _ = self.events.send(MappingEvent::Deleted(mapping));
                true
            }
            None => false,
        }
    }

    /// Returns a copy of the named mapping.
    pub fn get(&self, name: &str) -> Option<IAMIdentityMapping> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn snapshot(&self) -> Vec<IAMIdentityMapping> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IdentityMappingClient for InMemoryMappingClient {
    async fn list(&self) -> Result<Vec<IAMIdentityMapping>> {
        Ok(self.snapshot())
    }

    fn watch(&self) -> BoxStream<'static, Result<MappingEvent>> {
        // Subscribe before taking the snapshot so no write falls in between.
        let receiver = self.events.subscribe();
        let initial = stream::once(futures::future::ready(Ok(MappingEvent::Restarted(
            self.snapshot(),
        ))));

        let updates = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), receiver)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(ClientError::Watch(format!("watch fell behind by {missed} events"))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        initial.chain(updates).boxed()
    }

    async fn update_status(&self, name: &str, status: &IAMIdentityMappingStatus) -> Result<()> {
        let updated = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let mapping = objects
                .get_mut(name)
                .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
            mapping.status = Some(status.clone());
            mapping.clone()
        };

        let _ = self.events.send(MappingEvent::Applied(updated));
        Ok(())
    }
}

/// An event captured by [`InMemoryClusterClient`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Name of the mapping the event is about.
    pub object: String,
    /// Severity.
    pub type_: EventType,
    /// Short machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// Built-in resource client that only remembers what it was asked to do.
#[derive(Debug, Default)]
pub struct InMemoryClusterClient {
    events: Mutex<Vec<RecordedEvent>>,
}

impl InMemoryClusterClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event recorded so far.
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClusterClient for InMemoryClusterClient {
    async fn record_event(
        &self,
        mapping: &IAMIdentityMapping,
        type_: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                object: mapping.name_any(),
                type_,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        Ok(())
    }
}
