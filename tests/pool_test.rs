//! Connection Pool Tests
//!
//! Covers:
//! - Strict FIFO granting (the head is never bypassed)
//! - Discovered and updated connection capacity
//! - Wait queue bound and waiter hooks
//! - Cancellation, connect failures, close, retire, remove
//! - Idle cleanup and serde of config/stats
//! - Grants dispatched onto the waiter's own event loop

use relaynet::base::neterror::NetError;
use relaynet::future::{Context, Deferred};
use relaynet::pool::{
    Acquire, Connected, Connector, Lease, Pool, PoolConfig, PoolStats, Waiter, WaiterListener,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Connector whose attempts are settled by the test.
#[derive(Clone, Default)]
struct ManualConnector {
    pending: Arc<Mutex<Vec<Deferred<Connected<u32>>>>>,
    closed: Arc<Mutex<Vec<u32>>>,
}

impl ManualConnector {
    fn attempts(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn succeed(&self, attempt: usize, connection: u32, concurrency: u32) {
        let deferred = self.pending.lock().unwrap()[attempt].clone();
        assert!(deferred.complete(Connected {
            connection,
            concurrency,
        }));
    }

    fn fail(&self, attempt: usize, error: NetError) {
        let deferred = self.pending.lock().unwrap()[attempt].clone();
        assert!(deferred.fail(error));
    }

    fn closed(&self) -> Vec<u32> {
        self.closed.lock().unwrap().clone()
    }
}

impl Connector<u32> for ManualConnector {
    fn connect(&self, context: &Context) -> Deferred<Connected<u32>> {
        let deferred = Deferred::new(context);
        self.pending.lock().unwrap().push(deferred.clone());
        deferred
    }

    fn close(&self, connection: u32) {
        self.closed.lock().unwrap().push(connection);
    }
}

/// Connector that connects instantly.
struct InstantConnector {
    next: AtomicU32,
    concurrency: u32,
}

impl Connector<u32> for InstantConnector {
    fn connect(&self, context: &Context) -> Deferred<Connected<u32>> {
        Deferred::succeeded(
            context,
            Connected {
                connection: self.next.fetch_add(1, Ordering::Relaxed),
                concurrency: self.concurrency,
            },
        )
    }
}

fn granted(acquire: &Acquire<u32>) -> Lease<u32> {
    match acquire.result().outcome() {
        Some(Ok(lease)) => lease,
        other => panic!("expected a grant, got {:?}", other.map(|o| o.map(|l| l.weight()))),
    }
}

fn failure(acquire: &Acquire<u32>) -> NetError {
    match acquire.result().outcome() {
        Some(Err(e)) => e,
        _ => panic!("expected a failure"),
    }
}

fn manual_pool(config: PoolConfig) -> (Pool<u32>, ManualConnector) {
    let connector = ManualConnector::default();
    (Pool::new(config, connector.clone()), connector)
}

#[test]
fn test_strict_fifo_head_blocks_smaller_waiters() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    assert_eq!(connector.attempts(), 1);
    connector.succeed(0, 7, 2);
    let l1 = granted(&a1);

    // Room left on the connection: granted without queueing.
    let a2 = pool.acquire(&ctx, 1);
    let l2 = granted(&a2);
    assert_eq!(l1.connection_id(), l2.connection_id());

    let w1 = pool.acquire(&ctx, 2);
    let w2 = pool.acquire(&ctx, 1);
    assert!(!w1.result().is_complete());
    assert!(!w2.result().is_complete());
    assert_eq!(pool.stats().waiters, 2);

    // One unit free: W2 would fit but W1 is the head.
    assert!(l1.recycle());
    assert!(!w1.result().is_complete());
    assert!(!w2.result().is_complete());

    assert!(l2.recycle());
    let lw1 = granted(&w1);
    assert_eq!(lw1.weight(), 2);
    assert!(!w2.result().is_complete());
    assert!(w2.waiter().is_queued());

    assert!(lw1.recycle());
    assert_eq!(granted(&w2).weight(), 1);
    assert_eq!(connector.attempts(), 1);
}

#[test]
fn test_new_requester_never_overtakes_queue() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 1, 2);
    let _l1 = granted(&a1);

    let big = pool.acquire(&ctx, 2);
    let small = pool.acquire(&ctx, 1);
    assert!(!big.result().is_complete());
    assert!(!small.result().is_complete(), "a fitting request must queue behind the head");
}

#[test]
fn test_discovered_capacity_serves_queue() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let waiters: Vec<_> = (0..3).map(|_| pool.acquire(&ctx, 1)).collect();
    assert_eq!(connector.attempts(), 1);
    assert_eq!(pool.stats().connecting, 1);

    connector.succeed(0, 9, 3);
    let leases: Vec<_> = waiters.iter().map(granted).collect();
    assert!(leases.iter().all(|l| *l.get() == 9));

    let stats = pool.stats();
    assert_eq!(stats.capacity, 3);
    assert_eq!(stats.leased, 3);
    assert_eq!(stats.waiters, 0);
}

#[test]
fn test_update_concurrency_raises_and_lowers_lazily() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 1, 1);
    let l1 = granted(&a1);
    let id = l1.connection_id();

    let a2 = pool.acquire(&ctx, 1);
    let a3 = pool.acquire(&ctx, 1);
    assert!(!a2.result().is_complete());

    assert!(pool.update_concurrency(id, 3));
    let l2 = granted(&a2);
    let l3 = granted(&a3);

    assert!(pool.update_concurrency(id, 1));
    let stats = pool.stats();
    assert_eq!(stats.leased, 3);
    assert_eq!(stats.capacity, 3, "capacity never drops below the leased weight");

    l1.recycle();
    assert_eq!(pool.stats().capacity, 2);
    l2.recycle();
    l3.recycle();
    let stats = pool.stats();
    assert_eq!(stats.capacity, 1);
    assert_eq!(stats.leased, 0);
}

#[test]
fn test_wait_queue_bound() {
    let ctx = Context::serial();
    let (pool, connector) =
        manual_pool(PoolConfig::default().with_max_connections(1).with_max_wait_queue(1));

    let covered = pool.acquire(&ctx, 1);
    let parked = pool.acquire(&ctx, 1);
    let rejected = pool.acquire(&ctx, 1);

    assert_eq!(connector.attempts(), 1);
    assert!(!covered.result().is_complete());
    assert!(!parked.result().is_complete());
    assert!(matches!(failure(&rejected), NetError::WaitQueueFull { max: 1 }));
    assert!(rejected.waiter().is_disposed());

    let stats = pool.stats();
    assert_eq!(stats.waiters, 2);
    assert_eq!(stats.parked, 1);
}

#[test]
fn test_unbounded_queue_never_rejects() {
    let ctx = Context::serial();
    let (pool, _connector) = manual_pool(PoolConfig::default().with_max_connections(1));
    let waiters: Vec<_> = (0..1000).map(|_| pool.acquire(&ctx, 1)).collect();
    assert!(waiters.iter().all(|w| !w.result().is_complete()));
    assert_eq!(pool.stats().waiters, 1000);
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<&'static str>>,
}

impl WaiterListener for RecordingListener {
    fn on_enqueue(&self, _waiter: &Waiter) {
        self.events.lock().unwrap().push("enqueue");
    }

    fn on_connect(&self, _waiter: &Waiter) {
        self.events.lock().unwrap().push("connect");
    }
}

#[test]
fn test_waiter_hooks() {
    let ctx = Context::serial();
    let (pool, _connector) = manual_pool(PoolConfig::default().with_max_connections(1));
    let listener = Arc::new(RecordingListener::default());

    let _first = pool.acquire_with(&ctx, 1, listener.clone());
    let _second = pool.acquire_with(&ctx, 1, listener.clone());

    assert_eq!(*listener.events.lock().unwrap(), vec!["connect", "enqueue"]);
}

#[test]
fn test_cancel_head_unblocks_next() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 1, 2);
    let _l1 = granted(&a1);

    let head = pool.acquire(&ctx, 2);
    let next = pool.acquire(&ctx, 1);
    assert!(!next.result().is_complete());

    assert!(pool.cancel(head.waiter()));
    assert!(!pool.cancel(head.waiter()), "cancel is idempotent");
    assert!(head.waiter().is_disposed());
    assert!(!head.result().is_complete(), "a cancelled waiter gets no completion");

    assert_eq!(granted(&next).weight(), 1);
    assert!(!pool.cancel(next.waiter()), "cancel after grant is a no-op");
}

#[test]
fn test_cancel_from_other_pool_is_ignored() {
    let ctx = Context::serial();
    let (pool_a, _ca) = manual_pool(PoolConfig::default().with_max_connections(1));
    let (pool_b, _cb) = manual_pool(PoolConfig::default().with_max_connections(1));

    let waiter = pool_a.acquire(&ctx, 1);
    assert!(!pool_b.cancel(waiter.waiter()));
    assert!(waiter.waiter().is_queued());
}

#[tokio::test]
async fn test_caller_timeout_then_cancel() {
    let ctx = Context::serial();
    let (pool, _connector) = manual_pool(PoolConfig::default().with_max_connections(1));
    let _first = pool.acquire(&ctx, 1);
    let second = pool.acquire(&ctx, 1);

    let raced = tokio::time::timeout(Duration::from_millis(20), second.result().clone()).await;
    assert!(raced.is_err());
    assert!(pool.cancel(second.waiter()));
    assert_eq!(pool.stats().waiters, 1);
}

#[test]
fn test_connect_failure_fails_its_waiter_and_retries_for_others() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    let a2 = pool.acquire(&ctx, 1);
    assert_eq!(connector.attempts(), 1);

    connector.fail(0, NetError::ConnectionRefused);
    assert!(matches!(failure(&a1), NetError::ConnectionRefused));
    assert!(!a2.result().is_complete());
    assert_eq!(connector.attempts(), 2, "a new attempt starts for the next waiter");

    connector.succeed(1, 5, 1);
    assert_eq!(*granted(&a2).get(), 5);
}

#[test]
fn test_connector_panic_fails_waiter() {
    struct PanickingConnector;
    impl Connector<u32> for PanickingConnector {
        fn connect(&self, _context: &Context) -> Deferred<Connected<u32>> {
            panic!("connector exploded");
        }
    }

    let ctx = Context::serial();
    let pool = Pool::new(PoolConfig::default().with_max_connections(1), PanickingConnector);
    let acquire = pool.acquire(&ctx, 1);
    assert!(matches!(failure(&acquire), NetError::CallbackPanicked { .. }));
    assert_eq!(pool.stats().connections, 0);
}

#[test]
fn test_zero_capacity_rejected() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default());
    let acquire = pool.acquire(&ctx, 0);
    assert!(matches!(failure(&acquire), NetError::InvalidArgument(_)));
    assert_eq!(connector.attempts(), 0);
}

#[test]
fn test_close_fails_waiters_and_drains_leases() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 3, 1);
    let l1 = granted(&a1);
    let queued = pool.acquire(&ctx, 1);

    pool.close();
    assert!(pool.is_closed());
    assert!(matches!(failure(&queued), NetError::PoolClosed));
    assert!(connector.closed().is_empty(), "leased connection stays open");

    let late = pool.acquire(&ctx, 1);
    assert!(matches!(failure(&late), NetError::PoolClosed));

    l1.recycle();
    assert_eq!(connector.closed(), vec![3]);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[test]
fn test_retire_closes_after_drain() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 4, 2);
    let l1 = granted(&a1);

    assert!(pool.retire(l1.connection_id()));
    assert_eq!(pool.stats().closing, 1);

    // Closing grants nothing new; a replacement is opened once it is gone.
    let a2 = pool.acquire(&ctx, 1);
    assert!(!a2.result().is_complete());

    l1.recycle();
    assert_eq!(connector.closed(), vec![4]);
    assert_eq!(connector.attempts(), 2);
}

#[test]
fn test_remove_makes_leases_inert() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 6, 1);
    let l1 = granted(&a1);

    assert!(pool.remove(l1.connection_id()));
    assert!(!pool.remove(l1.connection_id()));
    assert_eq!(connector.closed(), vec![6]);
    assert_eq!(pool.stats().connections, 0);

    assert!(l1.recycle());
    assert!(!l1.recycle());
    assert_eq!(pool.stats().leased, 0);
}

#[test]
fn test_dropping_last_handle_recycles() {
    let ctx = Context::serial();
    let pool = Pool::new(
        PoolConfig::default().with_max_connections(1),
        InstantConnector {
            next: AtomicU32::new(1),
            concurrency: 1,
        },
    );

    let a1 = pool.acquire(&ctx, 1);
    let lease = granted(&a1);
    assert_eq!(pool.stats().leased, 1);

    drop(lease);
    drop(a1);
    assert_eq!(pool.stats().leased, 0);
}

#[test]
fn test_cleanup_idle() {
    let ctx = Context::serial();
    let (pool, connector) = manual_pool(
        PoolConfig::default()
            .with_max_connections(2)
            .with_idle_timeout(Duration::ZERO),
    );

    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 1, 1);
    let l1 = granted(&a1);
    assert_eq!(pool.cleanup_idle(), 0, "leased connections are not idle");

    l1.recycle();
    assert_eq!(pool.cleanup_idle(), 1);
    assert_eq!(connector.closed(), vec![1]);
    assert_eq!(pool.stats().connections, 0);
}

#[test]
fn test_config_and_stats_serde() {
    let config: PoolConfig = serde_json::from_str(r#"{"max_connections": 2}"#).unwrap();
    assert_eq!(config.max_connections, 2);
    assert_eq!(config.max_wait_queue, None);
    assert_eq!(config.idle_timeout, PoolConfig::default().idle_timeout);

    let ctx = Context::serial();
    let (pool, connector) = manual_pool(config);
    let a1 = pool.acquire(&ctx, 1);
    connector.succeed(0, 1, 4);
    let _l1 = granted(&a1);

    let json = serde_json::to_value(pool.stats()).unwrap();
    assert_eq!(json["active"], 1);
    assert_eq!(json["capacity"], 4);
    assert_eq!(json["leased"], 1);
    let back: PoolStats = serde_json::from_value(json).unwrap();
    assert_eq!(back, pool.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_release() {
    let pool = Pool::new(
        PoolConfig::default().with_max_connections(2),
        InstantConnector {
            next: AtomicU32::new(1),
            concurrency: 3,
        },
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = Context::serial();
            for _ in 0..50 {
                let lease = pool.acquire(&ctx, 1).await.unwrap();
                let stats = pool.stats();
                assert!(stats.leased <= stats.capacity);
                assert!(lease.recycle());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.waiters, 0);
    assert!(stats.connections <= 2);
}

#[test]
fn test_release_grants_on_waiter_event_loop() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let handle = runtime.handle().clone();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let event_loop = std::thread::spawn(move || {
        runtime.block_on(async {
            let _ = stop_rx.await;
        });
        std::thread::current().id()
    });

    let (pool, connector) = manual_pool(PoolConfig::default().with_max_connections(1));
    let first = pool.acquire(&Context::serial(), 1);
    connector.succeed(0, 7, 1);
    let lease = granted(&first);

    let waiter_ctx = Context::on_runtime(&handle);
    let second = pool.acquire(&waiter_ctx, 1);
    let (tx, rx) = std::sync::mpsc::channel();
    second.result().on_complete(move |outcome| {
        let _ = tx.send((std::thread::current().id(), outcome.map(|lease| *lease.get())));
    });
    assert_eq!(pool.stats().waiters, 1);

    let releaser = std::thread::spawn(move || {
        assert!(lease.recycle());
        std::thread::current().id()
    })
    .join()
    .unwrap();

    let (listener, connection) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(connection.unwrap(), 7);
    assert_ne!(listener, releaser);
    assert_ne!(listener, std::thread::current().id());

    stop_tx.send(()).unwrap();
    assert_eq!(listener, event_loop.join().unwrap());
}
