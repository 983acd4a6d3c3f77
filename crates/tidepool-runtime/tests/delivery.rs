//! Delivery strategy tests
//!
//! TigerStyle: Deterministic where possible (manual executor and clock),
//! real threads only where concurrency is the point.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tidepool_runtime::{
    batch, Actor, ActorContext, DeliveryStrategy, Error, InlineExecutor, ManualClock,
    ManualExecutor, Message, MethodTable, OverflowPolicy, Reply, Result, ServiceRef, Services,
};

// =============================================================================
// Test actors
// =============================================================================

#[derive(Default)]
struct Counter {
    total: u64,
}

impl Actor for Counter {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("add", |counter: &mut Counter, _ctx, amount: u64| {
            counter.total += amount;
            Ok(counter.total)
        });
        table
            .query("peek", |counter: &mut Counter, _ctx, (): ()| {
                Ok((counter.total, thread::current().id()))
            })
            .direct();
    }
}

/// Echoes its argument and counts overlapping invocations
struct Echo {
    in_flight: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    handled: u64,
}

impl Actor for Echo {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("echo", |echo: &mut Echo, _ctx, value: u64| {
            if echo.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                echo.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            echo.handled += 1;
            thread::yield_now();
            echo.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(value)
        });
        table.query("handled", |echo: &mut Echo, _ctx, (): ()| Ok(echo.handled));
    }
}

/// Records values in arrival order
struct Recorder {
    log: Arc<Mutex<Vec<u32>>>,
}

impl Actor for Recorder {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("record", |recorder: &mut Recorder, _ctx, value: u32| {
            recorder.log.lock().push(value);
            Ok(())
        });
    }
}

/// Sends a burst to a recorder from inside a handler
struct Relay {
    target: ServiceRef,
    log: Arc<Mutex<Vec<u32>>>,
    seen_before_return: Arc<AtomicUsize>,
}

impl Actor for Relay {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("fanout", |relay: &mut Relay, _ctx, count: u32| {
            for i in 0..count {
                relay.target.send("record", i);
            }
            relay
                .seen_before_return
                .store(relay.log.lock().len(), Ordering::SeqCst);
            Ok(())
        });
    }
}

tidepool_runtime::proxy! {
    /// Typed view over `Echo`
    struct EchoApi {
        query fn echo(value: u64) -> u64;
        query fn handled() -> u64;
    }
}

/// Offers straight to its peer from inside the handler, bypassing the outbox
struct Bouncer {
    name: &'static str,
    peer: Arc<Mutex<Option<ServiceRef>>>,
    log: Arc<Mutex<Vec<(&'static str, u32)>>>,
}

impl Actor for Bouncer {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("bounce", |bouncer: &mut Bouncer, _ctx, hops: u32| {
            bouncer.log.lock().push((bouncer.name, hops));
            if hops == 0 {
                return Ok(());
            }
            let peer = bouncer.peer.lock().clone();
            if let Some(peer) = peer {
                let message = Message::send(&peer, "bounce", hops - 1);
                assert!(peer.offer(message, Duration::ZERO));
            }
            Ok(())
        });
    }
}

fn manual_services() -> (Services, Arc<ManualExecutor>) {
    let executor = Arc::new(ManualExecutor::new());
    let services = Services::builder()
        .executor(executor.clone())
        .build()
        .unwrap();
    (services, executor)
}

fn inline_services() -> Services {
    Services::builder()
        .executor(Arc::new(InlineExecutor))
        .build()
        .unwrap()
}

type Outcomes = Arc<Mutex<Vec<Result<u64>>>>;

fn recording_reply(outcomes: &Outcomes) -> Reply<u64> {
    let outcomes = outcomes.clone();
    Reply::new(move |result: Result<u64>| outcomes.lock().push(result))
}

// =============================================================================
// Serial execution
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_runs_one_message_at_a_time() {
    let services = Services::new().unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let echo = services
        .new_service(Echo {
            in_flight: in_flight.clone(),
            overlaps: overlaps.clone(),
            handled: 0,
        })
        .address("/echo")
        .build()
        .unwrap();

    let clients = (0..8u64).map(|client| {
        let echo = echo.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..125u64 {
                let value = client * 1000 + i;
                let echoed: u64 = echo.call("echo", value).blocking_recv().unwrap();
                assert_eq!(echoed, value);
            }
        })
    });
    for joined in join_all(clients).await {
        joined.unwrap();
    }

    let handled: u64 = echo.call("handled", ()).await.unwrap();
    assert_eq!(handled, 1000);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    services.shutdown(tidepool_runtime::ShutdownMode::Graceful);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_calls_run_one_at_a_time() {
    let services = Services::new().unwrap();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let echo = services
        .new_service(Echo {
            in_flight: Arc::default(),
            overlaps: overlaps.clone(),
            handled: 0,
        })
        .address("/echo")
        .build()
        .unwrap();
    let api: EchoApi = echo.as_proxy().unwrap();

    let clients = (0..8u64).map(|client| {
        let api = api.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..125u64 {
                let value = client * 1000 + i;
                let (reply, echoed) = Reply::channel();
                assert!(api.echo(value, reply));
                assert_eq!(echoed.blocking_recv().unwrap(), value);
            }
        })
    });
    for joined in join_all(clients).await {
        joined.unwrap();
    }

    let (reply, handled) = Reply::channel();
    assert!(api.handled(reply));
    assert_eq!(handled.await.unwrap(), 1000);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    services.shutdown(tidepool_runtime::ShutdownMode::Graceful);
}

// =============================================================================
// Overflow policies
// =============================================================================

#[test]
fn test_reject_policy_refuses_past_capacity() {
    let (services, executor) = manual_services();
    let counter = services
        .new_service(Counter::default())
        .address("/bounded")
        .capacity(4)
        .overflow(OverflowPolicy::Reject)
        .build()
        .unwrap();

    let outcomes: Outcomes = Arc::default();
    let accepted = (0..10)
        .filter(|_| counter.query("add", 1u64, recording_reply(&outcomes)))
        .count();
    assert_eq!(accepted, 4);

    // Refused queries fail before the worker ever runs
    {
        let refused = outcomes.lock();
        assert_eq!(refused.len(), 6);
        assert!(refused
            .iter()
            .all(|r| matches!(r, Err(Error::MailboxFull { max: 4, .. }))));
    }

    executor.run_until_idle(16);

    let outcomes = outcomes.lock();
    let totals: Vec<u64> = outcomes.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(totals, vec![1, 2, 3, 4]);

    let stats = counter.stats();
    assert_eq!(stats.rejected, 6);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_drop_oldest_evicts_first_user_message() {
    let (services, executor) = manual_services();
    let counter = services
        .new_service(Counter::default())
        .capacity(2)
        .overflow(OverflowPolicy::DropOldest)
        .build()
        .unwrap();

    let outcomes: Outcomes = Arc::default();
    assert!(counter.query("add", 1u64, recording_reply(&outcomes)));
    assert!(counter.query("add", 10u64, recording_reply(&outcomes)));
    assert!(counter.query("add", 100u64, recording_reply(&outcomes)));

    {
        let dropped = outcomes.lock();
        assert_eq!(dropped.len(), 1);
        assert!(matches!(dropped[0], Err(Error::MessageDropped { .. })));
    }

    executor.run_until_idle(16);

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[1].as_ref().ok(), Some(&10));
    assert_eq!(outcomes[2].as_ref().ok(), Some(&110));
}

#[test]
fn test_block_policy_times_out() {
    let (services, _executor) = manual_services();
    let counter = services
        .new_service(Counter::default())
        .capacity(1)
        .overflow(OverflowPolicy::Block)
        .offer_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    let outcomes: Outcomes = Arc::default();
    assert!(counter.query("add", 1u64, recording_reply(&outcomes)));
    assert!(!counter.query("add", 1u64, recording_reply(&outcomes)));

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        Err(Error::OfferTimedOut { timeout_ms: 20, .. })
    ));
}

#[test]
fn test_blocked_offer_wakes_on_close() {
    let (services, _executor) = manual_services();
    let counter = services
        .new_service(Counter::default())
        .address("/blocking")
        .capacity(1)
        .overflow(OverflowPolicy::Block)
        .offer_timeout(Duration::MAX)
        .build()
        .unwrap();
    assert!(counter.query("add", 1u64, Reply::<u64>::ignore()));

    let blocked = {
        let counter = counter.clone();
        thread::spawn(move || counter.query("add", 1u64, Reply::<u64>::ignore()))
    };
    thread::sleep(Duration::from_millis(50));
    counter.close();

    assert!(!blocked.join().unwrap());
    assert!(counter.is_closed());
    assert!(matches!(
        services.service("/blocking"),
        Err(Error::ServiceNotFound { .. })
    ));
}

#[test]
fn test_closed_service_rejects() {
    let services = inline_services();
    let counter = services.new_service(Counter::default()).build().unwrap();
    counter.close();

    let outcomes: Outcomes = Arc::default();
    assert!(!counter.query("add", 1u64, recording_reply(&outcomes)));
    assert!(matches!(
        outcomes.lock()[0],
        Err(Error::ActorClosed { .. })
    ));
}

// =============================================================================
// Direct fast path
// =============================================================================

#[test]
fn test_direct_method_runs_on_caller_thread() {
    let (services, executor) = manual_services();
    let counter = services.new_service(Counter::default()).build().unwrap();

    // Not active yet: the call is queued behind the lifecycle messages
    let mut early = counter.call::<_, (u64, thread::ThreadId)>("peek", ());
    assert!(early.try_recv().is_none());
    executor.run_until_idle(16);
    assert!(early.try_recv().unwrap().is_ok());

    let mut peek = counter.call::<_, (u64, thread::ThreadId)>("peek", ());
    let (total, ran_on) = peek.try_recv().unwrap().unwrap();
    assert_eq!(total, 0);
    assert_eq!(ran_on, thread::current().id());
    assert_eq!(executor.pending_count(), 0);
}

#[test]
fn test_direct_strategy_runs_inline() {
    let (services, executor) = manual_services();
    let counter = services
        .new_service(Counter::default())
        .strategy(DeliveryStrategy::Direct)
        .build()
        .unwrap();

    let mut added = counter.call::<_, u64>("add", 7u64);
    assert_eq!(added.try_recv().unwrap().unwrap(), 7);
    assert_eq!(executor.pending_count(), 0);
}

#[test]
fn test_direct_fast_path_runs_after_batch() {
    struct Tally {
        total: u64,
        batches: Arc<AtomicUsize>,
    }

    impl Actor for Tally {
        fn methods(table: &mut MethodTable<Self>) {
            table
                .query("bump", |tally: &mut Tally, _ctx, amount: u64| {
                    tally.total += amount;
                    Ok(tally.total)
                })
                .direct();
        }

        fn after_batch(&mut self, _ctx: &mut ActorContext<'_>) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (services, executor) = manual_services();
    let batches = Arc::new(AtomicUsize::new(0));
    let tally = services
        .new_service(Tally {
            total: 0,
            batches: batches.clone(),
        })
        .build()
        .unwrap();
    executor.run_until_idle(16);
    let before = batches.load(Ordering::SeqCst);

    let mut bumped = tally.call::<_, u64>("bump", 2u64);
    assert_eq!(bumped.try_recv().unwrap().unwrap(), 2);
    assert_eq!(executor.pending_count(), 0);
    assert_eq!(batches.load(Ordering::SeqCst), before + 1);
}

#[test]
fn test_direct_chain_back_to_running_actor_is_deferred() {
    let services = inline_services();
    let log = Arc::new(Mutex::new(Vec::new()));
    let a_peer = Arc::new(Mutex::new(None));
    let b_peer = Arc::new(Mutex::new(None));
    let a = services
        .new_service(Bouncer {
            name: "a",
            peer: a_peer.clone(),
            log: log.clone(),
        })
        .strategy(DeliveryStrategy::Direct)
        .build()
        .unwrap();
    let b = services
        .new_service(Bouncer {
            name: "b",
            peer: b_peer.clone(),
            log: log.clone(),
        })
        .strategy(DeliveryStrategy::Direct)
        .build()
        .unwrap();
    *a_peer.lock() = Some(b.clone());
    *b_peer.lock() = Some(a.clone());

    // b offers back to a while a is still running: queued, not deadlocked
    assert!(a.send("bounce", 4u32));
    assert_eq!(
        *log.lock(),
        vec![("a", 4), ("b", 3), ("a", 2), ("b", 1), ("a", 0)]
    );
}

// =============================================================================
// Outbox
// =============================================================================

#[test]
fn test_handler_sends_flush_in_order_after_return() {
    let services = inline_services();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = services
        .new_service(Recorder { log: log.clone() })
        .build()
        .unwrap();
    let seen_before_return = Arc::new(AtomicUsize::new(usize::MAX));
    let relay = services
        .new_service(Relay {
            target: recorder,
            log: log.clone(),
            seen_before_return: seen_before_return.clone(),
        })
        .build()
        .unwrap();

    assert!(relay.send("fanout", 5u32));

    assert_eq!(seen_before_return.load(Ordering::SeqCst), 0);
    assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_batch_defers_sends_until_return() {
    let services = inline_services();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = services
        .new_service(Recorder { log: log.clone() })
        .build()
        .unwrap();

    let during = batch(|| {
        for i in 0..3u32 {
            recorder.send("record", i);
        }
        log.lock().len()
    });

    assert_eq!(during, 0);
    assert_eq!(*log.lock(), vec![0, 1, 2]);
}

// =============================================================================
// Expiry and errors
// =============================================================================

#[test]
fn test_message_expires_before_running() {
    let executor = Arc::new(ManualExecutor::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let services = Services::builder()
        .executor(executor.clone())
        .time(clock.clone())
        .build()
        .unwrap();
    let counter = services.new_service(Counter::default()).build().unwrap();

    let outcomes: Outcomes = Arc::default();
    let late = Message::query(&counter, "add", 1u64, recording_reply(&outcomes))
        .with_timeout(Duration::from_millis(100));
    let fresh = Message::query(&counter, "add", 2u64, recording_reply(&outcomes));
    assert!(counter.offer(late, Duration::ZERO));
    assert!(counter.offer(fresh, Duration::ZERO));

    clock.advance_ms(200);
    executor.run_until_idle(16);

    let outcomes = outcomes.lock();
    assert!(matches!(outcomes[0], Err(Error::MessageExpired { .. })));
    assert_eq!(outcomes[1].as_ref().ok(), Some(&2));
}

#[test]
fn test_offer_to_wrong_service_fails_message() {
    let services = inline_services();
    let a = services.new_service(Counter::default()).build().unwrap();
    let b = services.new_service(Counter::default()).build().unwrap();

    let outcomes: Outcomes = Arc::default();
    let message = Message::query(&a, "add", 1u64, recording_reply(&outcomes));
    assert!(!b.offer(message, Duration::ZERO));
    assert!(matches!(
        outcomes.lock()[0],
        Err(Error::IllegalArgument { .. })
    ));
}

#[test]
fn test_unknown_method_and_wrong_argument() {
    let services = inline_services();
    let counter = services.new_service(Counter::default()).build().unwrap();

    let missing = counter.call::<_, u64>("missing", ()).blocking_recv();
    assert!(matches!(missing, Err(Error::MethodNotFound { .. })));

    let mismatched = counter.call::<_, u64>("add", "one").blocking_recv();
    assert!(matches!(mismatched, Err(Error::ArgumentMismatch { .. })));

    // Still serving after the failures
    let total: u64 = counter.call("add", 3u64).blocking_recv().unwrap();
    assert_eq!(total, 3);
}

#[test]
fn test_deferred_query_panic_reports_handler_panicked() {
    struct Deferred;

    impl Actor for Deferred {
        fn methods(table: &mut MethodTable<Self>) {
            table.query_deferred(
                "later",
                |_deferred: &mut Deferred, _ctx, give_up: bool, reply: Reply<u64>| {
                    assert!(!give_up, "deferred handler gave up");
                    reply.ok(11);
                },
            );
            table.query_deferred(
                "forget",
                |_deferred: &mut Deferred, _ctx, (): (), reply: Reply<u64>| drop(reply),
            );
        }
    }

    let services = inline_services();
    let deferred = services.new_service(Deferred).build().unwrap();

    let panicked = deferred.call::<_, u64>("later", true).blocking_recv();
    match panicked {
        Err(Error::HandlerPanicked { method, message, .. }) => {
            assert_eq!(method, "later");
            assert!(message.contains("gave up"));
        }
        other => panic!("expected HandlerPanicked, got {:?}", other),
    }

    let answered: u64 = deferred.call("later", false).blocking_recv().unwrap();
    assert_eq!(answered, 11);
    assert!(matches!(
        deferred.call::<_, u64>("forget", ()).blocking_recv(),
        Err(Error::ReplyDropped)
    ));
}

// =============================================================================
// Spawn
// =============================================================================

struct Worker {
    calls: u64,
}

impl Actor for Worker {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("work", |worker: &mut Worker, _ctx, input: u64| {
            worker.calls += 1;
            Ok(input * 2)
        });
    }
}

#[test]
fn test_spawn_pool_bounds_concurrency() {
    let (services, executor) = manual_services();
    let created = Arc::new(AtomicUsize::new(0));
    let factory_created = created.clone();
    let pool = services
        .new_pool::<Worker, _>(move || {
            factory_created.fetch_add(1, Ordering::SeqCst);
            Worker { calls: 0 }
        })
        .address("/workers")
        .spawn_concurrency(2)
        .overflow(OverflowPolicy::Reject)
        .build()
        .unwrap();
    executor.run_until_idle(16);

    let outcomes: Outcomes = Arc::default();
    let accepted = (1..=3u64)
        .filter(|i| pool.query("work", *i, recording_reply(&outcomes)))
        .count();
    assert_eq!(accepted, 2);
    assert!(matches!(
        outcomes.lock()[0],
        Err(Error::MailboxFull { max: 2, .. })
    ));

    executor.run_until_idle(16);
    let outcomes = outcomes.lock();
    let doubled: Vec<u64> = outcomes.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(doubled, vec![2, 4]);
    assert!(created.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_spawn_close_shuts_pooled_instances() {
    struct Tracked {
        shutdowns: Arc<AtomicUsize>,
    }

    impl Actor for Tracked {
        fn methods(table: &mut MethodTable<Self>) {
            table.send("noop", |_tracked: &mut Tracked, _ctx, (): ()| Ok(()));
        }

        fn on_shutdown(
            &mut self,
            _ctx: &mut ActorContext<'_>,
            _mode: tidepool_runtime::ShutdownMode,
        ) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    let services = inline_services();
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counted = shutdowns.clone();
    let pool = services
        .new_pool::<Tracked, _>(move || Tracked {
            shutdowns: counted.clone(),
        })
        .build()
        .unwrap();
    assert!(pool.send("noop", ()));

    pool.close();
    assert!(pool.is_closed());
    assert!(shutdowns.load(Ordering::SeqCst) >= 1);
    assert!(!pool.send("noop", ()));
}

#[test]
fn test_current_service_inside_handler() {
    struct WhoAmI {
        seen: Arc<Mutex<Option<String>>>,
        outside: Arc<AtomicBool>,
    }

    impl Actor for WhoAmI {
        fn methods(table: &mut MethodTable<Self>) {
            table.send("check", |who: &mut WhoAmI, ctx, (): ()| {
                let current = ServiceRef::current().map(|s| s.address().to_string());
                assert_eq!(current.as_deref(), Some(ctx.address()));
                *who.seen.lock() = current;
                who.outside
                    .store(Services::current().is_some(), Ordering::SeqCst);
                Ok(())
            });
        }
    }

    let services = inline_services();
    let seen = Arc::new(Mutex::new(None));
    let outside = Arc::new(AtomicBool::new(false));
    let who = services
        .new_service(WhoAmI {
            seen: seen.clone(),
            outside: outside.clone(),
        })
        .address("/who")
        .build()
        .unwrap();

    assert!(ServiceRef::current().is_none());
    assert!(who.send("check", ()));
    assert_eq!(seen.lock().as_deref(), Some("/who"));
    assert!(outside.load(Ordering::SeqCst));
}
