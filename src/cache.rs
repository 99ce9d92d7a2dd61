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

//! Watch-based local cache of identity mappings.
//!
//! The cache keeps an immutable [`Snapshot`] of every known mapping. Its
//! background task builds a new snapshot for each change and publishes it
//! whole, so a reader holding a snapshot never sees a half-applied update.
//!
//! Reads are eventually consistent: until the first full list completes the
//! lister returns an empty view.
//!
//! The same changes are mirrored into a kube reflector [`Store`], which is
//! what the mapping controller's runtime reads objects from.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{IdentityMappingClient, MappingEvent};
use crate::mapping::IAMIdentityMapping;

/// How many change notifications a slow subscriber may fall behind by.
const CHANGE_CAPACITY: usize = 1024;

/// Delay between attempts at the initial list.
const LIST_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable view of the mapping collection at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    by_name: BTreeMap<String, Arc<IAMIdentityMapping>>,
    by_arn: HashMap<String, Arc<IAMIdentityMapping>>,
    synced: bool,
}

impl Snapshot {
    fn from_objects(objects: impl IntoIterator<Item = Arc<IAMIdentityMapping>>, synced: bool) -> Self {
        let by_name: BTreeMap<_, _> = objects.into_iter().map(|m| (m.key(), m)).collect();

        // Iterating by name makes the alphabetically first mapping win an
        // ARN collision.
        let mut by_arn = HashMap::with_capacity(by_name.len());
        for mapping in by_name.values() {
            by_arn
                .entry(mapping.index_key())
                .or_insert_with(|| Arc::clone(mapping));
        }

        Self {
            by_name,
            by_arn,
            synced,
        }
    }

    fn with_applied(&self, mapping: IAMIdentityMapping) -> Self {
        let mut objects = self.by_name.clone();
        objects.insert(mapping.key(), Arc::new(mapping));
        Self::from_objects(objects.into_values(), self.synced)
    }

    fn with_deleted(&self, name: &str) -> Self {
        let mut objects = self.by_name.clone();
        objects.remove(name);
        Self::from_objects(objects.into_values(), self.synced)
    }

    /// Returns the mapping with the given name.
    pub fn get(&self, name: &str) -> Option<Arc<IAMIdentityMapping>> {
        self.by_name.get(name).cloned()
    }

    /// Returns the mapping for a canonical ARN, compared case-insensitively.
    pub fn get_by_canonical_arn(&self, arn: &str) -> Option<Arc<IAMIdentityMapping>> {
        self.by_arn.get(&arn.to_lowercase()).cloned()
    }

    /// Iterates over all mappings in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<IAMIdentityMapping>> {
        self.by_name.values()
    }

    /// Returns the number of mappings.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns true if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Returns true once a full list has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

/// Read-only handle onto the cache. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Lister {
    snapshot: watch::Receiver<Arc<Snapshot>>,
    store: Store<IAMIdentityMapping>,
    started: Arc<AtomicBool>,
}

impl Lister {
    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Returns the mapping with the given name.
    pub fn get(&self, name: &str) -> Option<Arc<IAMIdentityMapping>> {
        self.snapshot().get(name)
    }

    /// Returns the mapping for a canonical ARN.
    pub fn get_by_canonical_arn(&self, arn: &str) -> Option<Arc<IAMIdentityMapping>> {
        self.snapshot().get_by_canonical_arn(arn)
    }

    /// Returns all mappings in name order.
    pub fn list(&self) -> Vec<Arc<IAMIdentityMapping>> {
        self.snapshot().iter().cloned().collect()
    }

    /// Returns the reflector store mirroring this cache.
    pub fn store(&self) -> Store<IAMIdentityMapping> {
        self.store.clone()
    }

    /// Returns true once the first full list has been applied.
    pub fn has_synced(&self) -> bool {
        self.snapshot.borrow().is_synced()
    }

    /// Returns true once [`WatchCache::start`] has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Waits until the cache has synced.
    ///
    /// Returns false if `cancel` fires first or the cache stopped before
    /// syncing.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut snapshot = self.snapshot.clone();
        tokio::select! {
            _ = cancel.cancelled() => false,
            synced = snapshot.wait_for(|s| s.is_synced()) => synced.is_ok(),
        }
    }
}

/// Builder and owner of the cache's background task.
pub struct WatchCache {
    client: Arc<dyn IdentityMappingClient>,
    resync_period: Duration,
    snapshot: watch::Sender<Arc<Snapshot>>,
    writer: Writer<IAMIdentityMapping>,
    changes: broadcast::Sender<String>,
    started: Arc<AtomicBool>,
}

impl std::fmt::Debug for WatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchCache")
            .field("resync_period", &self.resync_period)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl WatchCache {
    /// Creates a cache over `client`.
    ///
    /// A zero `resync_period` disables periodic relisting.
    pub fn build(client: Arc<dyn IdentityMappingClient>, resync_period: Duration) -> (Self, Lister) {
        let (snapshot, receiver) = watch::channel(Arc::new(Snapshot::default()));
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let started = Arc::new(AtomicBool::new(false));
        let (store, writer) = reflector::store();

        let lister = Lister {
            snapshot: receiver,
            store,
            started: Arc::clone(&started),
        };
        let cache = Self {
            client,
            resync_period,
            snapshot,
            writer,
            changes,
            started,
        };

        (cache, lister)
    }

    /// Returns the resync period the cache was built with.
    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }

    /// Registers for the names of mappings that change.
    ///
    /// Every name in the collection is sent again on each relist. Subscribe
    /// before calling [`WatchCache::start`] or early changes are missed.
    /// The channel closes when the cache stops.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// Starts the background list, watch and resync loop. Never blocks.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        self.started.store(true, Ordering::Release);
        tracing::info!(resync_period = ?self.resync_period, "starting identity mapping cache");
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.relist() => match result {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to list identity mappings, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(LIST_RETRY_INTERVAL) => {}
                        }
                    }
                },
            }
        }
        tracing::info!(mappings = self.current().len(), "identity mapping cache synced");

        let mut events = self.client.watch();
        let mut resync = resync_interval(self.resync_period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "identity mapping watch error, relisting");
                        if let Err(e) = self.relist().await {
                            tracing::warn!(error = %e, "relist after watch error failed");
                        }
                    }
                    None => {
                        tracing::warn!("identity mapping watch ended, restarting");
                        events = self.client.watch();
                    }
                },
                _ = tick(&mut resync) => {
                    tracing::debug!("resyncing identity mappings");
                    if let Err(e) = self.relist().await {
                        tracing::warn!(error = %e, "identity mapping resync failed");
                    }
                }
            }
        }

        tracing::info!("identity mapping cache stopped");
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    async fn relist(&mut self) -> crate::client::Result<()> {
        let objects = self.client.list().await?;
        self.apply(MappingEvent::Restarted(objects));
        Ok(())
    }

    fn apply(&mut self, event: MappingEvent) {
        self.mirror(&event);
        let current = self.current();

        let (next, changed) = match event {
            MappingEvent::Applied(mapping) => {
                let name = mapping.key();
                (current.with_applied(mapping), vec![name])
            }
            MappingEvent::Deleted(mapping) => {
                let name = mapping.key();
                (current.with_deleted(&name), vec![name])
            }
            MappingEvent::Restarted(objects) => {
                let next = Snapshot::from_objects(objects.into_iter().map(Arc::new), true);
                let names: BTreeSet<String> = current
                    .by_name
                    .keys()
                    .chain(next.by_name.keys())
                    .cloned()
                    .collect();
                (next, names.into_iter().collect())
            }
        };

        self.snapshot.send_replace(Arc::new(next));
        for name in changed {
            // No subscribers is fine.
            let _ = self.changes.send(name);
        }
    }

    fn mirror(&mut self, event: &MappingEvent) {
        match event {
            MappingEvent::Applied(mapping) => self
                .writer
                .apply_watcher_event(&watcher::Event::Apply(mapping.clone())),
            MappingEvent::Deleted(mapping) => self
                .writer
                .apply_watcher_event(&watcher::Event::Delete(mapping.clone())),
            MappingEvent::Restarted(objects) => {
                self.writer.apply_watcher_event(&watcher::Event::Init);
                for mapping in objects {
                    self.writer
                        .apply_watcher_event(&watcher::Event::InitApply(mapping.clone()));
                }
                self.writer.apply_watcher_event(&watcher::Event::InitDone);
            }
        }
    }
}

fn resync_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryMappingClient;
    use crate::mapping::{IAMIdentityMappingSpec, IAMIdentityMappingStatus};

    fn mapping(name: &str, arn: &str) -> IAMIdentityMapping {
        IAMIdentityMapping::new(
            name,
            IAMIdentityMappingSpec {
                arn: arn.to_string(),
                username: name.to_string(),
                groups: vec!["system:masters".to_string()],
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

    #[tokio::test]
    async fn test_lister_empty_before_start() {
        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:iam::1:role/Admin"));

        let (_cache, lister) = WatchCache::build(client, Duration::ZERO);
        assert!(!lister.is_started());
        assert!(!lister.has_synced());
        assert!(lister.list().is_empty());
    }

    #[tokio::test]
    async fn test_initial_list_and_watch() {
        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:iam::1:role/Admin"));

        let (cache, lister) = WatchCache::build(client.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();
        let task = cache.start(cancel.clone());
        assert!(lister.is_started());

        assert!(lister.wait_for_sync(&cancel).await);
        assert_eq!(lister.list().len(), 1);
        assert!(lister
            .get_by_canonical_arn("ARN:AWS:IAM::1:ROLE/ADMIN")
            .is_some());

        client.apply(mapping("dev", "arn:aws:iam::1:user/Dev"));
        eventually(|| lister.get("dev").is_some()).await;

        client.delete("admin");
        eventually(|| lister.get("admin").is_none()).await;
        assert!(lister.get_by_canonical_arn("arn:aws:iam::1:role/admin").is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_mirrors_cache() {
        use kube::runtime::reflector::ObjectRef;

        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:iam::1:role/Admin"));

        let (cache, lister) = WatchCache::build(client.clone(), Duration::ZERO);
        let store = lister.store();
        assert!(store.state().is_empty());

        let cancel = CancellationToken::new();
        let task = cache.start(cancel.clone());
        assert!(lister.wait_for_sync(&cancel).await);
        eventually(|| store.get(&ObjectRef::new("admin")).is_some()).await;

        client.apply(mapping("dev", "arn:aws:iam::1:user/Dev"));
        eventually(|| store.get(&ObjectRef::new("dev")).is_some()).await;

        client.delete("admin");
        eventually(|| store.get(&ObjectRef::new("admin")).is_none()).await;
        assert_eq!(store.state().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_moves_arn_index() {
        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:sts::1:assumed-role/Admin/s"));

        let (cache, lister) = WatchCache::build(client.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();
        let task = cache.start(cancel.clone());
        assert!(lister.wait_for_sync(&cancel).await);

        client
            .update_status(
                "admin",
                &IAMIdentityMappingStatus {
                    canonical_arn: Some("arn:aws:iam::1:role/Admin".to_string()),
                    user_id: None,
                },
            )
            .await
            .unwrap();

        eventually(|| lister.get_by_canonical_arn("arn:aws:iam::1:role/Admin").is_some()).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:iam::1:role/Admin"));

        let (cache, lister) = WatchCache::build(client.clone(), Duration::ZERO);
        let mut changes = cache.subscribe();
        let cancel = CancellationToken::new();
        let task = cache.start(cancel.clone());

        assert_eq!(changes.recv().await.unwrap(), "admin");
        assert!(lister.has_synced());

        client.apply(mapping("dev", "arn:aws:iam::1:user/Dev"));
        loop {
            if changes.recv().await.unwrap() == "dev" {
                break;
            }
        }

        cancel.cancel();
        task.await.unwrap();
        // Sender is gone once the task ends.
        loop {
            match changes.recv().await {
                Ok(_) => continue,
                Err(e) => {
                    assert!(matches!(e, broadcast::error::RecvError::Closed));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_wait_for_sync_cancelled() {
        let client = Arc::new(InMemoryMappingClient::new());
        let (_cache, lister) = WatchCache::build(client, Duration::ZERO);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!lister.wait_for_sync(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_renotifies() {
        let client = Arc::new(InMemoryMappingClient::new());
        client.apply(mapping("admin", "arn:aws:iam::1:role/Admin"));

        let (cache, _lister) = WatchCache::build(client, Duration::from_secs(60));
        let mut changes = cache.subscribe();
        let cancel = CancellationToken::new();
        let task = cache.start(cancel.clone());

        // Initial list, then the watch's own restart.
        assert_eq!(changes.recv().await.unwrap(), "admin");
        assert_eq!(changes.recv().await.unwrap(), "admin");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(changes.recv().await.unwrap(), "admin");

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_snapshot_arn_collision_prefers_first_name() {
        let snapshot = Snapshot::from_objects(
            [
                Arc::new(mapping("b", "arn:aws:iam::1:role/Admin")),
                Arc::new(mapping("a", "arn:aws:iam::1:role/Admin")),
            ],
            true,
        );
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot
                .get_by_canonical_arn("arn:aws:iam::1:role/Admin")
                .unwrap()
                .key(),
            "a"
        );
    }
}
