//! Per-strategy cache of live tenant connections.
//!
//! The cache maps a tenant to a ready client and guarantees:
//!
//! - **Coalescing**: concurrent misses for one tenant share a single connect.
//!   The connect runs on its own task, so a caller that gives up does not
//!   cancel it for the others, and its result still lands in the cache.
//! - **Visibility**: an entry only appears once its client is fully ready.
//!   A failed connect leaves nothing behind and its error reaches every
//!   waiter.
//! - **Bounded lifetime**: entries expire after `max_age`, after
//!   `idle_timeout` without use, or when `max_entries` forces the least
//!   recently used one out.
//! - **Deferred close**: callers hold [`Connection`] leases. An evicted entry
//!   leaves the map at once, but its client is only closed after the last
//!   lease is dropped. [`invalidate`](ConnectionCache::invalidate) and
//!   [`clear`](ConnectionCache::clear) close immediately.
//!
//! All state lives behind one mutex per cache; the mutex is never held across
//! an await.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{TenantError, TenantResult};
use crate::tenant::TenantId;

/// Closes a client that left the cache.
pub type Closer<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

type Lease = Arc<()>;
type SharedConnect<C> = Shared<BoxFuture<'static, TenantResult<(C, Lease)>>>;

/// A leased tenant connection.
///
/// Dereferences to the client. While any clone of a `Connection` is alive the
/// cache will not close the underlying client on eviction. Dropping it
/// releases the lease; it never closes the client.
pub struct Connection<C> {
    tenant: TenantId,
    client: C,
    _lease: Lease,
}

impl<C> Connection<C> {
    fn new(tenant: TenantId, client: C, lease: Lease) -> Self {
        Self {
            tenant,
            client,
            _lease: lease,
        }
    }

    /// The tenant this connection belongs to.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: Clone> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            client: self.client.clone(),
            _lease: Arc::clone(&self._lease),
        }
    }
}

impl<C> Deref for Connection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C: fmt::Debug> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("tenant", &self.tenant)
            .field("client", &self.client)
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Ready entries.
    pub entries: usize,
    /// Evicted clients waiting for their leases to be released.
    pub draining: usize,
    /// Lookups served from a ready entry.
    pub hits: u64,
    /// Lookups that started a connect.
    pub misses: u64,
    /// Lookups that joined a connect already in flight.
    pub coalesced: u64,
    /// Connects that populated an entry.
    pub connects: u64,
    /// Connects that failed.
    pub failures: u64,
    /// Entries removed by expiry or capacity.
    pub evictions: u64,
    /// Clients handed to the closer.
    pub closed: u64,
}

impl CacheStats {
    /// Fraction of lookups served without connecting.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

struct Entry<C> {
    client: C,
    lease: Lease,
    created_at: Instant,
    last_used_at: Instant,
}

impl<C> Entry<C> {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.lease) > 1
    }
}

enum Slot<C> {
    Ready(Entry<C>),
    Connecting {
        generation: u64,
        connect: SharedConnect<C>,
    },
}

struct Retired<C> {
    tenant: TenantId,
    client: C,
    lease: Lease,
}

struct State<C> {
    slots: HashMap<TenantId, Slot<C>>,
    draining: Vec<Retired<C>>,
    generation: u64,
    stats: CacheStats,
}

impl<C> State<C> {
    fn is_current(&self, tenant: &TenantId, generation: u64) -> bool {
        matches!(
            self.slots.get(tenant),
            Some(Slot::Connecting { generation: g, .. }) if *g == generation
        )
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Take an evicted entry out of service. Returns the client when it can
    /// be closed right away.
    fn retire(&mut self, tenant: TenantId, entry: Entry<C>) -> Option<C> {
        self.stats.evictions += 1;
        if entry.in_use() {
            debug!(tenant = %tenant, "Deferring close of leased tenant connection");
            self.draining.push(Retired {
                tenant,
                client: entry.client,
                lease: entry.lease,
            });
            None
        } else {
            self.stats.closed += 1;
            Some(entry.client)
        }
    }

    /// Take draining clients whose leases have all been released.
    fn collect_released(&mut self) -> Vec<C> {
        if self.draining.is_empty() {
            return Vec::new();
        }
        let (released, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut self.draining)
            .into_iter()
            .partition(|retired| Arc::strong_count(&retired.lease) == 1);
        self.draining = busy;
        self.stats.closed += released.len() as u64;
        released.into_iter().map(|retired| retired.client).collect()
    }

    /// Evict least recently used entries until at most `max` remain,
    /// preferring entries nobody holds. `keep` is never evicted.
    fn enforce_capacity(&mut self, max: usize, keep: &TenantId) -> Vec<C> {
        let mut released = Vec::new();
        while self.ready_count() > max {
            let victim = self
                .slots
                .iter()
                .filter_map(|(tenant, slot)| match slot {
                    Slot::Ready(entry) if tenant != keep => {
                        Some(((entry.in_use(), entry.last_used_at), tenant))
                    }
                    _ => None,
                })
                .min_by_key(|(rank, _)| *rank)
                .map(|(_, tenant)| tenant.clone());

            let Some(victim) = victim else { break };
            if let Some(Slot::Ready(entry)) = self.slots.remove(&victim) {
                debug!(tenant = %victim, "Evicting least recently used tenant connection");
                released.extend(self.retire(victim, entry));
            }
        }
        released
    }
}

enum Lookup<C> {
    Hit(Connection<C>),
    Wait(SharedConnect<C>),
    Expired,
    Miss,
}

/// Maps tenants to live, ready clients.
pub struct ConnectionCache<C> {
    state: Arc<Mutex<State<C>>>,
    config: CacheConfig,
    closer: Closer<C>,
}

impl<C: Clone + Send + Sync + 'static> ConnectionCache<C> {
    /// Create a cache that hands departing clients to `closer`.
    pub fn new(config: CacheConfig, closer: Closer<C>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                draining: Vec::new(),
                generation: 0,
                stats: CacheStats::default(),
            })),
            config,
            closer,
        }
    }

    /// The cache bounds.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the tenant's connection, calling `connect` on a miss.
    ///
    /// At most one connect per tenant is in flight; concurrent callers wait
    /// for it and all receive its result.
    pub async fn get_or_connect<F, Fut>(&self, tenant: &TenantId, connect: F) -> TenantResult<Connection<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TenantResult<C>> + Send + 'static,
    {
        let (pending, released) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut released = state.collect_released();

            let lookup = match state.slots.get_mut(tenant) {
                Some(Slot::Ready(entry)) if !self.is_expired(entry, now) => {
                    entry.last_used_at = now;
                    Lookup::Hit(Connection::new(
                        tenant.clone(),
                        entry.client.clone(),
                        Arc::clone(&entry.lease),
                    ))
                }
                Some(Slot::Ready(_)) => Lookup::Expired,
                Some(Slot::Connecting { connect, .. }) => Lookup::Wait(connect.clone()),
                None => Lookup::Miss,
            };

            match lookup {
                Lookup::Hit(connection) => {
                    state.stats.hits += 1;
                    drop(state);
                    self.close_in_background(released);
                    return Ok(connection);
                }
                Lookup::Wait(pending) => {
                    state.stats.coalesced += 1;
                    debug!(tenant = %tenant, "Joining in-flight tenant connect");
                    (pending, released)
                }
                Lookup::Expired | Lookup::Miss => {
                    if let Some(Slot::Ready(entry)) = state.slots.remove(tenant) {
                        debug!(tenant = %tenant, "Tenant connection expired");
                        released.extend(state.retire(tenant.clone(), entry));
                    }
                    state.stats.misses += 1;
                    debug!(tenant = %tenant, "Connection cache miss");
                    (self.start_connect(&mut state, tenant, connect()), released)
                }
            }
        };

        self.close_in_background(released);
        let (client, lease) = pending.await?;
        Ok(Connection::new(tenant.clone(), client, lease))
    }

    fn start_connect<Fut>(&self, state: &mut State<C>, tenant: &TenantId, connect: Fut) -> SharedConnect<C>
    where
        Fut: Future<Output = TenantResult<C>> + Send + 'static,
    {
        let generation = state.generation;
        state.generation += 1;

        let task_state = Arc::clone(&self.state);
        let closer = Arc::clone(&self.closer);
        let max_entries = self.config.max_entries;
        let key = tenant.clone();

        let task = tokio::spawn(async move {
            let result = connect.await;
            let mut to_close = Vec::new();
            let outcome = {
                let mut state = task_state.lock();
                let current = state.is_current(&key, generation);
                match result {
                    Ok(client) if current => {
                        let now = Instant::now();
                        let lease = Lease::new(());
                        state.slots.insert(
                            key.clone(),
                            Slot::Ready(Entry {
                                client: client.clone(),
                                lease: Arc::clone(&lease),
                                created_at: now,
                                last_used_at: now,
                            }),
                        );
                        state.stats.connects += 1;
                        if let Some(max) = max_entries {
                            to_close = state.enforce_capacity(max, &key);
                        }
                        Ok((client, lease))
                    }
                    Ok(client) => {
                        state.stats.closed += 1;
                        to_close.push(client);
                        Err(TenantError::connection_closed("Connection cache").with_tenant(&key))
                    }
                    Err(err) => {
                        if current {
                            state.slots.remove(&key);
                        }
                        state.stats.failures += 1;
                        Err(err.with_tenant(&key))
                    }
                }
            };
            for client in to_close {
                closer(client).await;
            }
            outcome
        });

        let cleanup_state = Arc::clone(&self.state);
        let key = tenant.clone();
        let pending = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let mut state = cleanup_state.lock();
                    if state.is_current(&key, generation) {
                        state.slots.remove(&key);
                    }
                    state.stats.failures += 1;
                    Err(TenantError::internal(format!("Tenant connect task failed: {}", join_error))
                        .with_tenant(&key))
                }
            }
        }
        .boxed()
        .shared();

        state.slots.insert(
            tenant.clone(),
            Slot::Connecting {
                generation,
                connect: pending.clone(),
            },
        );
        pending
    }

    /// Remove and close the tenant's entry immediately.
    ///
    /// Waits for an in-flight connect for the tenant first, so a connect that
    /// started before this call cannot repopulate the cache after it.
    /// Evicted clients of the tenant still waiting on leases are closed too.
    /// Returns whether anything was closed.
    pub async fn invalidate(&self, tenant: &TenantId) -> bool {
        enum Step<C> {
            Wait(SharedConnect<C>),
            Close(Vec<C>),
        }

        loop {
            let step = {
                let mut state = self.state.lock();
                match state.slots.get(tenant) {
                    Some(Slot::Connecting { connect, .. }) => Step::Wait(connect.clone()),
                    _ => {
                        let mut to_close = Vec::new();
                        if let Some(Slot::Ready(entry)) = state.slots.remove(tenant) {
                            to_close.push(entry.client);
                        }
                        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.draining)
                            .into_iter()
                            .partition(|retired| &retired.tenant == tenant);
                        state.draining = rest;
                        to_close.extend(mine.into_iter().map(|retired| retired.client));
                        state.stats.closed += to_close.len() as u64;
                        Step::Close(to_close)
                    }
                }
            };

            match step {
                Step::Wait(pending) => {
                    let _ = pending.await;
                }
                Step::Close(to_close) => {
                    let closed = !to_close.is_empty();
                    for client in to_close {
                        (self.closer)(client).await;
                    }
                    if closed {
                        debug!(tenant = %tenant, "Invalidated tenant connection");
                    }
                    return closed;
                }
            }
        }
    }

    /// Close every client, leased or not, and empty the cache.
    ///
    /// Connects still in flight finish on their own and close their client.
    /// Returns the number of clients closed.
    pub async fn clear(&self) -> usize {
        let to_close: Vec<C> = {
            let mut state = self.state.lock();
            let slots = std::mem::take(&mut state.slots);
            let draining = std::mem::take(&mut state.draining);
            let to_close: Vec<C> = slots
                .into_values()
                .filter_map(|slot| match slot {
                    Slot::Ready(entry) => Some(entry.client),
                    Slot::Connecting { .. } => None,
                })
                .chain(draining.into_iter().map(|retired| retired.client))
                .collect();
            state.stats.closed += to_close.len() as u64;
            to_close
        };

        let count = to_close.len();
        for client in to_close {
            (self.closer)(client).await;
        }
        count
    }

    /// Evict expired entries and close released ones.
    ///
    /// Returns the number of entries evicted.
    pub async fn evict_expired(&self) -> usize {
        let (evicted, to_close) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let expired: Vec<TenantId> = state
                .slots
                .iter()
                .filter_map(|(tenant, slot)| match slot {
                    Slot::Ready(entry) if self.is_expired(entry, now) => Some(tenant.clone()),
                    _ => None,
                })
                .collect();

            let mut to_close = Vec::new();
            for tenant in &expired {
                if let Some(Slot::Ready(entry)) = state.slots.remove(tenant) {
                    to_close.extend(state.retire(tenant.clone(), entry));
                }
            }
            to_close.extend(state.collect_released());
            (expired.len(), to_close)
        };

        for client in to_close {
            (self.closer)(client).await;
        }
        if evicted > 0 {
            debug!(evicted, "Evicted expired tenant connections");
        }
        evicted
    }

    /// Check if the tenant has a ready entry.
    pub fn contains(&self, tenant: &TenantId) -> bool {
        matches!(self.state.lock().slots.get(tenant), Some(Slot::Ready(_)))
    }

    /// Tenants with a ready entry.
    pub fn tenants(&self) -> Vec<TenantId> {
        let state = self.state.lock();
        let mut tenants: Vec<TenantId> = state
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        tenants
    }

    /// Number of ready entries.
    pub fn len(&self) -> usize {
        self.state.lock().ready_count()
    }

    /// Check if there are no ready entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.ready_count(),
            draining: state.draining.len(),
            ..state.stats
        }
    }

    fn is_expired(&self, entry: &Entry<C>, now: Instant) -> bool {
        let aged = self
            .config
            .max_age
            .is_some_and(|max| now.duration_since(entry.created_at) >= max);
        let idle = !entry.in_use()
            && self
                .config
                .idle_timeout
                .is_some_and(|timeout| now.duration_since(entry.last_used_at) >= timeout);
        aged || idle
    }

    fn close_in_background(&self, clients: Vec<C>) {
        for client in clients {
            tokio::spawn((self.closer)(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        cache: Arc<ConnectionCache<u32>>,
        connects: Arc<AtomicU32>,
        closed: Arc<Mutex<Vec<u32>>>,
    }

    impl Harness {
        fn new(config: CacheConfig) -> Self {
            let closed = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&closed);
            let closer: Closer<u32> = Arc::new(move |client: u32| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().push(client) }.boxed()
            });
            Self {
                cache: Arc::new(ConnectionCache::new(config, closer)),
                connects: Arc::new(AtomicU32::new(0)),
                closed,
            }
        }

        /// Connect after `delay`, yielding a fresh client number.
        async fn get(&self, tenant: &str, delay: Duration) -> TenantResult<Connection<u32>> {
            let connects = Arc::clone(&self.connects);
            self.cache
                .get_or_connect(&tid(tenant), move || async move {
                    tokio::time::sleep(delay).await;
                    Ok(connects.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
        }

        fn closed(&self) -> Vec<u32> {
            self.closed.lock().clone()
        }
    }

    fn tid(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_connect_once() {
        let harness = Arc::new(Harness::new(CacheConfig::default()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let harness = Arc::clone(&harness);
                tokio::spawn(async move { harness.get("acme", Duration::from_millis(50)).await })
            })
            .collect();

        for task in tasks {
            let connection = task.await.unwrap().unwrap();
            assert_eq!(*connection, 1);
            assert_eq!(connection.tenant_id().as_str(), "acme");
        }
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);

        let stats = harness.cache.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 15);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_tenants_are_independent() {
        let harness = Harness::new(CacheConfig::default());
        let (a, b) = tokio::join!(harness.get("acme", FAST), harness.get("globex", FAST));
        assert_ne!(*a.unwrap(), *b.unwrap());
        assert_eq!(harness.cache.tenants(), vec![tid("acme"), tid("globex")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter() {
        let harness = Harness::new(CacheConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let acme = tid("acme");

        let failing = || {
            let attempts = Arc::clone(&attempts);
            harness.cache.get_or_connect(&acme, move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<u32, _>(TenantError::connection("refused"))
            })
        };

        let (a, b, c) = tokio::join!(failing(), failing(), failing());
        for result in [a, b, c] {
            let err = result.unwrap_err();
            assert!(err.is_connection_error());
            assert_eq!(err.context.tenant.as_deref(), Some("acme"));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(harness.cache.is_empty());
        assert_eq!(harness.cache.stats().failures, 1);

        // Nothing was cached, so the next call connects again.
        assert_eq!(*harness.get("acme", FAST).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_cancel_connect() {
        let harness = Harness::new(CacheConfig::default());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), harness.get("acme", Duration::from_millis(100))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.cache.contains(&tid("acme")));

        let connection = harness.get("acme", FAST).await.unwrap();
        assert_eq!(*connection, 1);
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
        assert_eq!(harness.cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let harness = Harness::new(CacheConfig::unbounded().with_max_entries(2));

        drop(harness.get("a", FAST).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(harness.get("b", FAST).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(harness.get("a", FAST).await.unwrap());
        drop(harness.get("c", FAST).await.unwrap());

        assert_eq!(harness.cache.tenants(), vec![tid("a"), tid("c")]);
        assert_eq!(harness.closed(), vec![2]);
        assert_eq!(harness.cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_defers_close_while_leased() {
        let harness = Harness::new(CacheConfig::unbounded().with_max_entries(1));

        let held = harness.get("a", FAST).await.unwrap();
        drop(harness.get("b", FAST).await.unwrap());

        // "a" left the cache but is still leased, so it stays open.
        assert!(!harness.cache.contains(&tid("a")));
        assert!(harness.closed().is_empty());
        assert_eq!(harness.cache.stats().draining, 1);

        // The leased client keeps working until released.
        assert_eq!(*held, 1);
        let copy = held.clone();
        drop(held);
        harness.cache.evict_expired().await;
        assert!(harness.closed().is_empty());

        drop(copy);
        harness.cache.evict_expired().await;
        assert_eq!(harness.closed(), vec![1]);
        assert_eq!(harness.cache.stats().draining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let harness = Harness::new(CacheConfig::unbounded().with_idle_timeout(Duration::from_secs(10)));

        drop(harness.get("a", FAST).await.unwrap());
        let held = harness.get("b", FAST).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(harness.cache.evict_expired().await, 1);

        // Only the idle entry expired; the held one is in use.
        assert_eq!(harness.closed(), vec![1]);
        assert!(harness.cache.contains(&tid("b")));
        drop(held);

        assert_eq!(*harness.get("a", FAST).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_reconnects() {
        let harness = Harness::new(CacheConfig::unbounded().with_max_age(Duration::from_secs(5)));

        let old = harness.get("a", FAST).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = harness.get("a", FAST).await.unwrap();
        assert_eq!(*fresh, 2);
        assert!(harness.closed().is_empty());

        drop(old);
        harness.cache.evict_expired().await;
        assert_eq!(harness.closed(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_waits_for_in_flight_connect() {
        let harness = Arc::new(Harness::new(CacheConfig::default()));

        let background = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.get("a", Duration::from_millis(100)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(harness.cache.invalidate(&tid("a")).await);
        assert!(!harness.cache.contains(&tid("a")));
        assert_eq!(harness.closed(), vec![1]);

        // The waiter still got the client that was opened for it.
        assert_eq!(*background.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_closes_leased_immediately() {
        let harness = Harness::new(CacheConfig::default());
        let held = harness.get("a", FAST).await.unwrap();

        assert!(harness.cache.invalidate(&tid("a")).await);
        assert_eq!(harness.closed(), vec![1]);
        assert!(!harness.cache.invalidate(&tid("a")).await);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_closes_everything() {
        let harness = Harness::new(CacheConfig::unbounded().with_max_entries(1));
        let held = harness.get("a", FAST).await.unwrap();
        drop(harness.get("b", FAST).await.unwrap());

        assert_eq!(harness.cache.clear().await, 2);
        let mut closed = harness.closed();
        closed.sort();
        assert_eq!(closed, vec![1, 2]);
        assert!(harness.cache.is_empty());
        assert_eq!(harness.cache.stats().draining, 0);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_connect_closes_late_client() {
        let harness = Arc::new(Harness::new(CacheConfig::default()));

        let background = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.get("a", Duration::from_millis(100)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.cache.clear().await, 0);

        let err = background.await.unwrap().unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(harness.closed(), vec![1]);
        assert!(harness.cache.is_empty());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
