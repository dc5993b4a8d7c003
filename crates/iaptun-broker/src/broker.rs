//! Tunnel broker

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use iaptun_tunnel::{RelayPolicy, Tunnel, TunnelDestination, TunnelError, TunnelService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::events::{EventSink, TunnelEvent};

type CreationFuture = Shared<BoxFuture<'static, Result<Arc<dyn Tunnel>, TunnelError>>>;

/// One tunnel creation, pending or finished
struct CacheEntry {
    /// Distinguishes a replaced entry from its successor
    id: u64,
    creation: CreationFuture,
    /// Set once the "opened" event has been published
    announced: AtomicBool,
}

impl CacheEntry {
    /// The finished tunnel, if creation succeeded
    fn tunnel(&self) -> Option<&Arc<dyn Tunnel>> {
        match self.creation.peek() {
            Some(Ok(tunnel)) => Some(tunnel),
            _ => None,
        }
    }

    /// Faulted, or finished with a tunnel that has since been closed
    fn is_stale(&self) -> bool {
        match self.creation.peek() {
            None => false,
            Some(Ok(tunnel)) => tunnel.is_closed(),
            Some(Err(_)) => true,
        }
    }
}

/// Cache of tunnels keyed by destination.
///
/// All cache mutations happen under one lock; tunnel creation, probing and
/// closing happen outside of it.
pub struct TunnelBroker {
    service: Arc<dyn TunnelService>,
    events: Arc<dyn EventSink>,
    cache: Mutex<HashMap<TunnelDestination, Arc<CacheEntry>>>,
    next_entry_id: AtomicU64,
}

impl std::fmt::Debug for TunnelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let destinations: Vec<String> = self.cache().keys().map(|d| d.to_string()).collect();
        f.debug_struct("TunnelBroker")
            .field("destinations", &destinations)
            .finish()
    }
}

impl TunnelBroker {
    pub fn new(service: Arc<dyn TunnelService>, events: Arc<dyn EventSink>) -> Self {
        Self {
            service,
            events,
            cache: Mutex::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<TunnelDestination, Arc<CacheEntry>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tunnels whose creation has completed successfully
    pub fn open_tunnels(&self) -> Vec<Arc<dyn Tunnel>> {
        self.cache()
            .values()
            .filter_map(|entry| entry.tunnel())
            .filter(|tunnel| !tunnel.is_closed())
            .cloned()
            .collect()
    }

    /// Connected or connecting. A momentary snapshot, not a lock.
    pub fn is_connected(&self, destination: &TunnelDestination) -> bool {
        self.cache()
            .get(destination)
            .is_some_and(|entry| !entry.is_stale())
    }

    /// Return the tunnel for `destination`, creating it if needed.
    ///
    /// The tunnel is probed before it is returned. A tunnel that fails the
    /// probe is evicted and closed; the next call creates a new one.
    pub async fn connect(
        &self,
        destination: &TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
        timeout: Duration,
    ) -> Result<Arc<dyn Tunnel>, BrokerError> {
        let entry = self.lookup_or_create(destination, policy);

        let tunnel = entry.creation.clone().await.map_err(|source| {
            warn!("Failed to create tunnel to {}: {}", destination, source);
            BrokerError::CreationFailed {
                destination: destination.clone(),
                source,
            }
        })?;

        if let Err(source) = tunnel.probe(timeout).await {
            warn!("Probe of tunnel to {} failed: {}", destination, source);

            if self.evict(destination, entry.id) {
                debug!("Evicted tunnel to {}", destination);
            }
            if let Err(e) = tunnel.close().await {
                error!("Failed to close broken tunnel to {}: {}", destination, e);
            }

            return Err(BrokerError::ProbeFailed {
                destination: destination.clone(),
                source,
            });
        }

        // Under the lock so a concurrent disconnect publishes Closed after Opened
        let cache = self.cache();
        let current = cache
            .get(destination)
            .is_some_and(|cached| cached.id == entry.id);
        if !current || tunnel.is_closed() {
            debug!("Tunnel to {} was disconnected while connecting", destination);
            return Err(BrokerError::ProbeFailed {
                destination: destination.clone(),
                source: TunnelError::Closed,
            });
        }

        if !entry.announced.swap(true, Ordering::SeqCst) {
            info!(
                "Tunnel to {} open on local port {}",
                destination,
                tunnel.local_port()
            );
            self.events.publish(TunnelEvent::Opened(destination.clone()));
        }
        drop(cache);

        Ok(tunnel)
    }

    /// Close the tunnel to `destination` and forget it.
    ///
    /// A creation still in flight is awaited first.
    pub async fn disconnect(&self, destination: &TunnelDestination) -> Result<(), BrokerError> {
        let removed = self.cache().remove(destination);
        let entry = removed.ok_or_else(|| BrokerError::NotFound(destination.clone()))?;

        let tunnel = entry
            .creation
            .clone()
            .await
            .map_err(|source| BrokerError::CreationFailed {
                destination: destination.clone(),
                source,
            })?;

        tunnel
            .close()
            .await
            .map_err(|source| BrokerError::CloseFailed {
                destination: destination.clone(),
                source,
            })?;

        info!("Tunnel to {} disconnected", destination);
        self.events.publish(TunnelEvent::Closed(destination.clone()));
        Ok(())
    }

    /// Disconnect every destination known at the time of the call.
    ///
    /// All destinations are attempted; failures are collected into
    /// [`BrokerError::Teardown`].
    pub async fn disconnect_all(&self) -> Result<(), BrokerError> {
        let destinations: Vec<TunnelDestination> = self.cache().keys().cloned().collect();
        debug!("Disconnecting {} tunnel(s)", destinations.len());

        let results = join_all(destinations.iter().map(|d| self.disconnect(d))).await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                // Disconnected concurrently by someone else
                Err(BrokerError::NotFound(_)) => {}
                Err(e) => {
                    error!("{}", e);
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Teardown(failures))
        }
    }

    fn lookup_or_create(
        &self,
        destination: &TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
    ) -> Arc<CacheEntry> {
        let mut cache = self.cache();

        if let Some(entry) = cache.get(destination) {
            if !entry.is_stale() {
                return entry.clone();
            }
            debug!("Replacing stale tunnel entry for {}", destination);
        }

        let entry = self.start_creation(destination, policy);
        cache.insert(destination.clone(), entry.clone());
        entry
    }

    /// Spawn the creation so it makes progress even if the first caller goes away
    fn start_creation(
        &self,
        destination: &TunnelDestination,
        policy: Arc<dyn RelayPolicy>,
    ) -> Arc<CacheEntry> {
        debug!("Creating tunnel to {}", destination);

        let service = self.service.clone();
        let task_destination = destination.clone();
        let task =
            tokio::spawn(async move { service.create_tunnel(&task_destination, policy).await });

        let creation = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(TunnelError::ConnectionError(format!(
                    "Tunnel creation task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        Arc::new(CacheEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::Relaxed),
            creation,
            announced: AtomicBool::new(false),
        })
    }

    /// Remove the entry only if it is still the one identified by `entry_id`
    fn evict(&self, destination: &TunnelDestination, entry_id: u64) -> bool {
        let mut cache = self.cache();
        if cache.get(destination).is_some_and(|entry| entry.id == entry_id) {
            cache.remove(destination);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MockEventSink, NoopEventSink};
    use async_trait::async_trait;
    use iaptun_tunnel::{AllowAllRelayPolicy, InstanceLocator, TunnelStatistics};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU16, AtomicUsize};

    #[derive(Debug)]
    struct FakeTunnel {
        destination: TunnelDestination,
        local_port: u16,
        probe_ok: bool,
        close_ok: bool,
        closed: AtomicBool,
        close_calls: AtomicUsize,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        fn destination(&self) -> &TunnelDestination {
            &self.destination
        }

        fn local_port(&self) -> u16 {
            self.local_port
        }

        fn policy_id(&self) -> &str {
            "allowAll"
        }

        fn statistics(&self) -> TunnelStatistics {
            TunnelStatistics::default()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), TunnelError> {
            if self.is_closed() {
                return Err(TunnelError::Closed);
            }
            if self.probe_ok {
                Ok(())
            } else {
                Err(TunnelError::BackendUnreachable("probe failed".to_string()))
            }
        }

        async fn close(&self) -> Result<(), TunnelError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if !self.close_ok {
                return Err(TunnelError::Io("close failed".to_string()));
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FakeService {
        creations: AtomicUsize,
        delay: Duration,
        fail_next: AtomicUsize,
        probe_fails: AtomicBool,
        close_fails_for: Mutex<HashSet<TunnelDestination>>,
        next_port: AtomicU16,
        tunnels: Mutex<Vec<Arc<FakeTunnel>>>,
    }

    impl FakeService {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn creations(&self) -> usize {
            self.creations.load(Ordering::SeqCst)
        }

        fn tunnels(&self) -> Vec<Arc<FakeTunnel>> {
            self.tunnels.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelService for FakeService {
        async fn create_tunnel(
            &self,
            destination: &TunnelDestination,
            _policy: Arc<dyn RelayPolicy>,
        ) -> Result<Arc<dyn Tunnel>, TunnelError> {
            self.creations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TunnelError::AccessDenied("creation failed".to_string()));
            }

            let tunnel = Arc::new(FakeTunnel {
                destination: destination.clone(),
                local_port: 20000 + self.next_port.fetch_add(1, Ordering::SeqCst),
                probe_ok: !self.probe_fails.load(Ordering::SeqCst),
                close_ok: !self.close_fails_for.lock().unwrap().contains(destination),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            });
            self.tunnels.lock().unwrap().push(tunnel.clone());
            Ok(tunnel)
        }
    }

    fn destination(name: &str, port: u16) -> TunnelDestination {
        TunnelDestination::new(InstanceLocator::new("project-1", "zone-1", name), port)
    }

    fn policy() -> Arc<dyn RelayPolicy> {
        Arc::new(AllowAllRelayPolicy)
    }

    fn broker_with(service: &Arc<FakeService>) -> TunnelBroker {
        TunnelBroker::new(service.clone(), Arc::new(NoopEventSink))
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_connect_reuse_and_disconnect() {
        let service = Arc::new(FakeService::default());
        let broker = broker_with(&service);
        let dest = destination("instance-1", 3389);

        let first = broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        let open = broker.open_tunnels();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].destination(), &dest);

        let second = broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        assert_eq!(service.creations(), 1);
        assert_eq!(second.local_port(), first.local_port());

        broker.disconnect(&dest).await.unwrap();
        assert!(broker.open_tunnels().is_empty());
        assert!(!broker.is_connected(&dest));
        assert!(first.is_closed());

        let result = broker.disconnect(&dest).await;
        assert!(matches!(result, Err(BrokerError::NotFound(d)) if d == dest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_creation() {
        let service = Arc::new(FakeService::with_delay(Duration::from_millis(100)));
        let broker = broker_with(&service);
        let dest = destination("instance-1", 22);

        let (a, b) = tokio::join!(
            broker.connect(&dest, policy(), TIMEOUT),
            broker.connect(&dest, policy(), TIMEOUT)
        );

        assert_eq!(service.creations(), 1);
        assert_eq!(a.unwrap().local_port(), b.unwrap().local_port());
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_destinations_are_independent() {
        let service = Arc::new(FakeService::with_delay(Duration::from_millis(100)));
        let broker = broker_with(&service);

        let (vm_a, vm_b) = (destination("vm-a", 22), destination("vm-b", 22));
        let (a, b) = tokio::join!(
            broker.connect(&vm_a, policy(), TIMEOUT),
            broker.connect(&vm_b, policy(), TIMEOUT)
        );

        assert_eq!(service.creations(), 2);
        assert_ne!(a.unwrap().local_port(), b.unwrap().local_port());
        assert_eq!(broker.open_tunnels().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_creation_counts_as_connected() {
        let service = Arc::new(FakeService::with_delay(Duration::from_millis(100)));
        let broker = Arc::new(broker_with(&service));
        let dest = destination("instance-1", 22);

        let connect = tokio::spawn({
            let broker = broker.clone();
            let dest = dest.clone();
            async move { broker.connect(&dest, policy(), TIMEOUT).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());

        connect.await.unwrap().unwrap();
        assert_eq!(broker.open_tunnels().len(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_is_replaced_on_next_connect() {
        let service = Arc::new(FakeService::default());
        service.fail_next.store(1, Ordering::SeqCst);
        let broker = broker_with(&service);
        let dest = destination("instance-1", 22);

        let result = broker.connect(&dest, policy(), TIMEOUT).await;
        match result {
            Err(BrokerError::CreationFailed { destination, source }) => {
                assert_eq!(destination, dest);
                assert_eq!(source, TunnelError::AccessDenied("creation failed".to_string()));
            }
            other => panic!("expected creation failure, got {:?}", other),
        }
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());

        broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        assert_eq!(service.creations(), 2);
        assert!(broker.is_connected(&dest));
    }

    #[tokio::test]
    async fn test_probe_failure_evicts_and_closes() {
        let service = Arc::new(FakeService::default());
        service.probe_fails.store(true, Ordering::SeqCst);
        let broker = broker_with(&service);
        let dest = destination("instance-1", 22);

        let result = broker.connect(&dest, policy(), TIMEOUT).await;
        assert!(matches!(result, Err(BrokerError::ProbeFailed { .. })));
        assert!(!broker.is_connected(&dest));
        assert!(broker.open_tunnels().is_empty());

        let tunnels = service.tunnels();
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels[0].is_closed());

        // The next attempt starts from scratch
        service.probe_fails.store(false, Ordering::SeqCst);
        broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        assert_eq!(service.creations(), 2);
    }

    #[tokio::test]
    async fn test_closed_tunnel_is_not_reused() {
        let service = Arc::new(FakeService::default());
        let broker = broker_with(&service);
        let dest = destination("instance-1", 22);

        let tunnel = broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        tunnel.close().await.unwrap();
        assert!(!broker.is_connected(&dest));

        let replacement = broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        assert_eq!(service.creations(), 2);
        assert!(!replacement.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_leaves_cache_untouched() {
        let service = Arc::new(FakeService::default());
        let broker = broker_with(&service);
        let connected = destination("instance-1", 22);
        broker.connect(&connected, policy(), TIMEOUT).await.unwrap();

        let result = broker.disconnect(&destination("never-connected", 22)).await;
        assert!(matches!(result, Err(BrokerError::NotFound(_))));

        assert!(broker.is_connected(&connected));
        assert_eq!(broker.open_tunnels().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_waits_for_pending_creation() {
        let service = Arc::new(FakeService::with_delay(Duration::from_millis(100)));
        let broker = Arc::new(broker_with(&service));
        let dest = destination("instance-1", 22);

        let connect = tokio::spawn({
            let broker = broker.clone();
            let dest = dest.clone();
            async move { broker.connect(&dest, policy(), TIMEOUT).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.disconnect(&dest).await.unwrap();

        let tunnels = service.tunnels();
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels[0].is_closed());
        assert!(!broker.is_connected(&dest));

        // The waiting connect never hands out the disconnected tunnel
        let result = connect.await.unwrap();
        assert!(matches!(result, Err(BrokerError::ProbeFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_creation_never_announces_open() {
        let dest = destination("instance-1", 22);

        let mut events = MockEventSink::new();
        let opened = dest.clone();
        events
            .expect_publish()
            .withf(move |event| *event == TunnelEvent::Opened(opened.clone()))
            .never();
        let closed = dest.clone();
        events
            .expect_publish()
            .withf(move |event| *event == TunnelEvent::Closed(closed.clone()))
            .times(1)
            .return_const(());

        let service = Arc::new(FakeService::with_delay(Duration::from_millis(100)));
        let broker = Arc::new(TunnelBroker::new(service.clone(), Arc::new(events)));

        let connect = tokio::spawn({
            let broker = broker.clone();
            let dest = dest.clone();
            async move { broker.connect(&dest, policy(), TIMEOUT).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.disconnect(&dest).await.unwrap();

        let result = connect.await.unwrap();
        assert!(matches!(
            result,
            Err(BrokerError::ProbeFailed {
                source: TunnelError::Closed,
                ..
            })
        ));
        assert!(broker.open_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_failed_creation_reports_it() {
        let service = Arc::new(FakeService::default());
        service.fail_next.store(1, Ordering::SeqCst);
        let broker = broker_with(&service);
        let dest = destination("instance-1", 22);

        assert!(broker.connect(&dest, policy(), TIMEOUT).await.is_err());

        let result = broker.disconnect(&dest).await;
        assert!(matches!(result, Err(BrokerError::CreationFailed { .. })));
        assert!(matches!(
            broker.disconnect(&dest).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all_attempts_every_destination() {
        let service = Arc::new(FakeService::default());
        let broker = broker_with(&service);
        let a = destination("vm-a", 22);
        let b = destination("vm-b", 22);
        let c = destination("vm-c", 22);
        service.close_fails_for.lock().unwrap().insert(b.clone());

        for dest in [&a, &b, &c] {
            broker.connect(dest, policy(), TIMEOUT).await.unwrap();
        }

        let result = broker.disconnect_all().await;
        match result {
            Err(BrokerError::Teardown(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    BrokerError::CloseFailed { destination, .. } if destination == &b
                ));
            }
            other => panic!("expected teardown failure, got {:?}", other),
        }

        for tunnel in service.tunnels() {
            assert_eq!(tunnel.close_calls.load(Ordering::SeqCst), 1);
            assert_eq!(tunnel.is_closed(), tunnel.destination != b);
        }
        assert!(broker.open_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_all_empty() {
        let service = Arc::new(FakeService::default());
        let broker = broker_with(&service);
        broker.disconnect_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_all_reports_failed_creations() {
        let service = Arc::new(FakeService::default());
        service.fail_next.store(1, Ordering::SeqCst);
        let broker = broker_with(&service);
        let failed = destination("vm-a", 22);
        let healthy = destination("vm-b", 22);

        assert!(broker.connect(&failed, policy(), TIMEOUT).await.is_err());
        broker.connect(&healthy, policy(), TIMEOUT).await.unwrap();

        match broker.disconnect_all().await {
            Err(BrokerError::Teardown(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    BrokerError::CreationFailed { destination, .. } if destination == &failed
                ));
            }
            other => panic!("expected teardown failure, got {:?}", other),
        }

        // Both entries are gone and the healthy tunnel was closed
        assert!(!broker.is_connected(&failed));
        assert!(!broker.is_connected(&healthy));
        assert!(broker.open_tunnels().is_empty());
        assert!(service.tunnels()[0].is_closed());
    }

    #[tokio::test]
    async fn test_events_published_once_per_tunnel() {
        let dest = destination("instance-1", 3389);

        let mut events = MockEventSink::new();
        let opened = dest.clone();
        events
            .expect_publish()
            .withf(move |event| *event == TunnelEvent::Opened(opened.clone()))
            .times(1)
            .return_const(());
        let closed = dest.clone();
        events
            .expect_publish()
            .withf(move |event| *event == TunnelEvent::Closed(closed.clone()))
            .times(1)
            .return_const(());

        let service = Arc::new(FakeService::default());
        let broker = TunnelBroker::new(service.clone(), Arc::new(events));

        broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        broker.connect(&dest, policy(), TIMEOUT).await.unwrap();
        broker.disconnect(&dest).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_events_for_failures() {
        let mut events = MockEventSink::new();
        events.expect_publish().never();

        let service = Arc::new(FakeService::default());
        service.probe_fails.store(true, Ordering::SeqCst);
        let broker = TunnelBroker::new(service.clone(), Arc::new(events));
        let dest = destination("instance-1", 22);

        assert!(broker.connect(&dest, policy(), TIMEOUT).await.is_err());
        assert!(matches!(
            broker.disconnect(&dest).await,
            Err(BrokerError::NotFound(_))
        ));
    }
}
