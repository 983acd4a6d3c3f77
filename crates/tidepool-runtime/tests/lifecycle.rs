//! Lifecycle, checkpoint, container and pinning tests
//!
//! TigerStyle: Every lifecycle hook observed through shared counters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tidepool_runtime::{
    read_json, write_json, Actor, ActorContext, ChildActor, ContainerConfig, Error, InlineExecutor,
    Journal, LifecycleState, ManualExecutor, MemoryJournal, MemoryJournalProvider, MethodTable,
    Reply, Result, RuntimeConfig, ServiceRef, Services, ShutdownMode,
};

fn inline_services() -> Services {
    Services::builder()
        .executor(Arc::new(InlineExecutor))
        .build()
        .unwrap()
}

// =============================================================================
// Checkpoints
// =============================================================================

#[derive(Default, Clone)]
struct AccountProbe {
    saves: Arc<AtomicUsize>,
    completed: Arc<Mutex<Vec<bool>>>,
    fail_save: Arc<AtomicBool>,
}

struct Account {
    balance: u64,
    probe: AccountProbe,
}

impl Account {
    fn new(probe: &AccountProbe) -> Self {
        Self {
            balance: 0,
            probe: probe.clone(),
        }
    }
}

impl Actor for Account {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("deposit", |account: &mut Account, _ctx, amount: u64| {
            account.balance += amount;
            Ok(())
        });
        table.query("balance", |account: &mut Account, _ctx, (): ()| {
            Ok(account.balance)
        });
    }

    fn on_replay(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()> {
        if let Some(balance) = read_json::<u64>(journal, ctx.address())? {
            self.balance = balance;
        }
        Ok(())
    }

    fn on_save(&mut self, ctx: &mut ActorContext<'_>, journal: &dyn Journal) -> Result<()> {
        if self.probe.fail_save.load(Ordering::SeqCst) {
            return Err(Error::internal("disk full"));
        }
        write_json(journal, ctx.address(), &self.balance)?;
        self.probe.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_save_complete(&mut self, _ctx: &mut ActorContext<'_>, succeeded: bool) {
        self.probe.completed.lock().push(succeeded);
    }
}

fn save(service: &ServiceRef) -> Result<()> {
    let (reply, rx) = Reply::channel();
    service.save(reply);
    rx.blocking_recv()
}

#[test]
fn test_save_then_replay_in_new_manager() {
    let provider = Arc::new(MemoryJournalProvider::new());
    let probe = AccountProbe::default();

    let first = Services::builder()
        .executor(Arc::new(InlineExecutor))
        .journal_provider(provider.clone())
        .build()
        .unwrap();
    let account = first
        .new_service(Account::new(&probe))
        .address("/accounts/a")
        .build()
        .unwrap();
    assert!(account.send("deposit", 5u64));
    assert!(account.send("deposit", 7u64));

    save(&account).unwrap();
    assert_eq!(probe.saves.load(Ordering::SeqCst), 1);
    assert_eq!(*probe.completed.lock(), vec![true]);
    let journal = provider.journal("default");
    assert_eq!(journal.checkpoint_count(), 1);
    assert!(journal.read_checkpoint("/accounts/a").unwrap().is_some());
    first.shutdown(ShutdownMode::Graceful);

    let second = Services::builder()
        .executor(Arc::new(InlineExecutor))
        .journal_provider(provider.clone())
        .build()
        .unwrap();
    let restored = second
        .new_service(Account::new(&probe))
        .address("/accounts/a")
        .build()
        .unwrap();
    let balance: u64 = restored.call("balance", ()).blocking_recv().unwrap();
    assert_eq!(balance, 12);
}

#[test]
fn test_save_uses_service_journal() {
    let services = inline_services();
    let journal = Arc::new(MemoryJournal::with_history("accounts"));
    let probe = AccountProbe::default();
    let account = services
        .new_service(Account::new(&probe))
        .address("/accounts/b")
        .journal(journal.clone())
        .build()
        .unwrap();

    assert!(account.send("deposit", 3u64));
    save(&account).unwrap();
    assert!(account.send("deposit", 4u64));
    save(&account).unwrap();
    assert_eq!(journal.checkpoint_count(), 2);
    assert_eq!(
        journal.history("/accounts/b"),
        vec![Bytes::from("3"), Bytes::from("7")]
    );
    assert_eq!(journal.address_count(), 1);
}

#[test]
fn test_failed_save_reports_checkpoint_failure() {
    let services = inline_services();
    let probe = AccountProbe::default();
    probe.fail_save.store(true, Ordering::SeqCst);
    let account = services
        .new_service(Account::new(&probe))
        .build()
        .unwrap();

    let result = save(&account);
    assert!(matches!(result, Err(Error::CheckpointFailed { .. })));
    assert_eq!(*probe.completed.lock(), vec![false]);
    assert_eq!(account.lifecycle(), LifecycleState::Active);
}

#[test]
fn test_save_before_start_fails() {
    let services = inline_services();
    let probe = AccountProbe::default();
    let account = services
        .new_service(Account::new(&probe))
        .auto_start(false)
        .build()
        .unwrap();
    assert_eq!(account.lifecycle(), LifecycleState::New);

    assert!(matches!(
        save(&account),
        Err(Error::ActorNotStarted { .. })
    ));

    account.start();
    assert_eq!(account.lifecycle(), LifecycleState::Active);
    save(&account).unwrap();
}

#[test]
fn test_save_after_close_fails() {
    let services = inline_services();
    let account = services
        .new_service(Account::new(&AccountProbe::default()))
        .build()
        .unwrap();
    account.close();

    assert!(matches!(save(&account), Err(Error::ActorClosed { .. })));
    assert_eq!(account.lifecycle(), LifecycleState::Closed);
}

// =============================================================================
// Activation
// =============================================================================

struct Flaky {
    fail_init: Arc<AtomicBool>,
}

impl Actor for Flaky {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("ping", |_flaky: &mut Flaky, _ctx, (): ()| Ok("pong"));
    }

    fn on_init(&mut self, _ctx: &mut ActorContext<'_>) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::internal("not ready"));
        }
        Ok(())
    }
}

#[test]
fn test_activation_failure_is_retried() {
    let services = inline_services();
    let fail_init = Arc::new(AtomicBool::new(true));
    let flaky = services
        .new_service(Flaky {
            fail_init: fail_init.clone(),
        })
        .build()
        .unwrap();

    let failed = flaky.call::<_, &str>("ping", ()).blocking_recv();
    assert!(matches!(failed, Err(Error::ActorActivationFailed { .. })));
    assert_eq!(flaky.lifecycle(), LifecycleState::New);

    fail_init.store(false, Ordering::SeqCst);
    let pong = flaky.call::<_, &str>("ping", ()).blocking_recv().unwrap();
    assert_eq!(pong, "pong");
    assert_eq!(flaky.lifecycle(), LifecycleState::Active);
}

// =============================================================================
// Shutdown
// =============================================================================

#[derive(Default)]
struct Quiet {
    shutdowns: Arc<Mutex<Vec<ShutdownMode>>>,
}

impl Actor for Quiet {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("ping", |_quiet: &mut Quiet, _ctx, (): ()| Ok(1u64));
    }

    fn on_shutdown(&mut self, _ctx: &mut ActorContext<'_>, mode: ShutdownMode) {
        self.shutdowns.lock().push(mode);
    }
}

#[test]
fn test_graceful_shutdown_runs_queued_messages() {
    let executor = Arc::new(ManualExecutor::new());
    let services = Services::builder()
        .executor(executor.clone())
        .build()
        .unwrap();
    let quiet = Quiet::default();
    let shutdowns = quiet.shutdowns.clone();
    let service = services.new_service(quiet).build().unwrap();

    let first = service.call::<_, u64>("ping", ());
    let second = service.call::<_, u64>("ping", ());
    service.shutdown(ShutdownMode::Graceful);
    assert!(service.is_closed());

    executor.run_until_idle(16);
    assert_eq!(first.blocking_recv().unwrap(), 1);
    assert_eq!(second.blocking_recv().unwrap(), 1);
    assert_eq!(*shutdowns.lock(), vec![ShutdownMode::Graceful]);
    assert_eq!(service.lifecycle(), LifecycleState::Closed);
}

#[test]
fn test_immediate_shutdown_fails_queued_messages() {
    let executor = Arc::new(ManualExecutor::new());
    let services = Services::builder()
        .executor(executor.clone())
        .build()
        .unwrap();
    let quiet = Quiet::default();
    let shutdowns = quiet.shutdowns.clone();
    let service = services.new_service(quiet).build().unwrap();

    let queued = service.call::<_, u64>("ping", ());
    service.shutdown(ShutdownMode::Immediate);
    assert!(matches!(
        queued.blocking_recv(),
        Err(Error::ActorClosed { .. })
    ));

    // Lifecycle messages survive an immediate shutdown; user messages do not
    executor.run_until_idle(16);
    assert_eq!(*shutdowns.lock(), vec![ShutdownMode::Immediate]);
    assert_eq!(service.lifecycle(), LifecycleState::Closed);
}

// =============================================================================
// Children
// =============================================================================

#[derive(Default, Clone)]
struct DirectoryProbe {
    creations: Arc<AtomicUsize>,
    child_saves: Arc<AtomicUsize>,
    child_shutdowns: Arc<AtomicUsize>,
}

struct UserDirectory {
    probe: DirectoryProbe,
}

impl Actor for UserDirectory {
    fn methods(table: &mut MethodTable<Self>) {
        table.query("children", |_dir: &mut UserDirectory, ctx, (): ()| {
            Ok(ctx.container().len())
        });
    }

    fn on_lookup(&mut self, _ctx: &mut ActorContext<'_>, path: &str) -> Option<ChildActor> {
        if !path.starts_with("user-") {
            return None;
        }
        self.probe.creations.fetch_add(1, Ordering::SeqCst);
        Some(ChildActor::new(Profile {
            saves: self.probe.child_saves.clone(),
            shutdowns: self.probe.child_shutdowns.clone(),
        }))
    }
}

struct Profile {
    saves: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl Actor for Profile {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("touch", |_profile: &mut Profile, ctx, (): ()| {
            assert!(ctx.mark_modified());
            Ok(())
        });
    }

    fn on_save(&mut self, _ctx: &mut ActorContext<'_>, _journal: &dyn Journal) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut ActorContext<'_>, _mode: ShutdownMode) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn lookup(parent: &ServiceRef, path: &str) -> Result<ServiceRef> {
    let (reply, rx) = Reply::channel();
    parent.lookup(path, reply);
    rx.blocking_recv()
}

fn directory_services(high_water: usize) -> Services {
    container_services(ContainerConfig {
        children_count_initial: 4,
        children_count_max: 16,
        modified_high_water: high_water,
    })
}

fn container_services(container: ContainerConfig) -> Services {
    let config = RuntimeConfig {
        container,
        ..RuntimeConfig::default()
    };
    Services::builder()
        .executor(Arc::new(InlineExecutor))
        .config(config)
        .build()
        .unwrap()
}

#[test]
fn test_lookup_creates_child_once() {
    let services = directory_services(8);
    let probe = DirectoryProbe::default();
    let directory = services
        .new_service(UserDirectory {
            probe: probe.clone(),
        })
        .address("/users")
        .build()
        .unwrap();

    let alice = lookup(&directory, "user-alice").unwrap();
    assert_eq!(alice.address(), "/users/user-alice");
    assert_eq!(lookup(&directory, "user-alice").unwrap(), alice);
    assert_eq!(probe.creations.load(Ordering::SeqCst), 1);

    let children: usize = directory.call("children", ()).blocking_recv().unwrap();
    assert_eq!(children, 1);

    // Children are reached through their parent, not the registry
    assert!(services.service("/users/user-alice").is_err());

    assert!(matches!(
        lookup(&directory, "admin"),
        Err(Error::ServiceNotFound { .. })
    ));
    assert!(matches!(
        lookup(&directory, ""),
        Err(Error::IllegalArgument { .. })
    ));
}

#[test]
fn test_parent_save_includes_modified_children() {
    let services = directory_services(8);
    let probe = DirectoryProbe::default();
    let directory = services
        .new_service(UserDirectory {
            probe: probe.clone(),
        })
        .build()
        .unwrap();

    let alice = lookup(&directory, "user-alice").unwrap();
    let bob = lookup(&directory, "user-bob").unwrap();
    assert!(alice.send("touch", ()));
    assert!(alice.send("touch", ()));
    assert!(bob.send("touch", ()));

    save(&directory).unwrap();
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 2);

    // Nothing dirty the second time
    save(&directory).unwrap();
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 2);
}

#[test]
fn test_modified_high_water_forces_save() {
    let services = directory_services(2);
    let probe = DirectoryProbe::default();
    let directory = services
        .new_service(UserDirectory {
            probe: probe.clone(),
        })
        .build()
        .unwrap();

    let children: Vec<ServiceRef> = ["user-a", "user-b", "user-c"]
        .iter()
        .map(|path| lookup(&directory, path).unwrap())
        .collect();

    assert!(children[0].send("touch", ()));
    assert!(children[1].send("touch", ()));
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 0);

    assert!(children[2].send("touch", ()));
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 3);
}

#[test]
fn test_evicted_child_is_saved_and_closed() {
    let services = container_services(ContainerConfig {
        children_count_initial: 1,
        children_count_max: 1,
        modified_high_water: 8,
    });
    let probe = DirectoryProbe::default();
    let directory = services
        .new_service(UserDirectory {
            probe: probe.clone(),
        })
        .address("/p")
        .build()
        .unwrap();

    let a1 = lookup(&directory, "user-a").unwrap();
    assert!(a1.send("touch", ()));
    let b = lookup(&directory, "user-b").unwrap();

    // Dirty child is checkpointed before it closes
    assert!(a1.is_closed());
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 1);
    assert_eq!(probe.child_shutdowns.load(Ordering::SeqCst), 1);
    assert!(!b.is_closed());

    let a2 = lookup(&directory, "user-a").unwrap();
    assert_eq!(a2.address(), "/p/user-a");
    assert_ne!(a2, a1);
    assert!(!a2.is_closed());
    assert!(b.is_closed());
    assert_eq!(probe.creations.load(Ordering::SeqCst), 3);
    assert_eq!(probe.child_shutdowns.load(Ordering::SeqCst), 2);
    // Clean children close without a save
    assert_eq!(probe.child_saves.load(Ordering::SeqCst), 1);

    directory.close();
    assert!(a2.is_closed());
    assert_eq!(probe.child_shutdowns.load(Ordering::SeqCst), 3);
}

#[test]
fn test_closing_parent_closes_children() {
    let services = directory_services(8);
    let directory = services
        .new_service(UserDirectory {
            probe: DirectoryProbe::default(),
        })
        .build()
        .unwrap();
    let alice = lookup(&directory, "user-alice").unwrap();

    directory.close();
    assert!(alice.is_closed());
    assert!(matches!(
        lookup(&directory, "user-bob"),
        Err(Error::ActorClosed { .. })
    ));
}

#[test]
fn test_top_level_actor_has_no_parent_to_mark() {
    struct Orphan;

    impl Actor for Orphan {
        fn methods(table: &mut MethodTable<Self>) {
            table.query("mark", |_orphan: &mut Orphan, ctx, (): ()| {
                Ok(ctx.mark_modified())
            });
        }
    }

    let services = inline_services();
    let orphan = services.new_service(Orphan).build().unwrap();
    let marked: bool = orphan.call("mark", ()).blocking_recv().unwrap();
    assert!(!marked);
}

// =============================================================================
// Pinning
// =============================================================================

#[derive(Default)]
struct Overlap {
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    handled: AtomicUsize,
}

impl Overlap {
    fn run(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::yield_now();
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Ledger {
    overlap: Arc<Overlap>,
}

impl Actor for Ledger {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("post", |ledger: &mut Ledger, _ctx, _amount: u64| {
            ledger.overlap.run();
            Ok(())
        });
        table.query("handled", |ledger: &mut Ledger, _ctx, (): ()| {
            Ok(ledger.overlap.handled.load(Ordering::SeqCst))
        });
    }
}

struct Auditor {
    overlap: Arc<Overlap>,
}

impl Actor for Auditor {
    fn methods(table: &mut MethodTable<Self>) {
        table.send("audit", |auditor: &mut Auditor, _ctx, _amount: u64| {
            auditor.overlap.run();
            Ok(())
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_listener_runs_serialized_with_parent() {
    let services = Services::new().unwrap();
    let overlap = Arc::new(Overlap::default());
    let ledger = services
        .new_service(Ledger {
            overlap: overlap.clone(),
        })
        .address("/ledger")
        .build()
        .unwrap();
    let auditor = ledger
        .pin(Auditor {
            overlap: overlap.clone(),
        })
        .unwrap();
    assert!(auditor.address().starts_with("/ledger#pin-"));
    assert_eq!(auditor.strategy(), ledger.strategy());

    let producers = (0..4u64).map(|producer| {
        let ledger = ledger.clone();
        let auditor = auditor.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..50u64 {
                assert!(ledger.send("post", producer * 100 + i));
                assert!(auditor.send("audit", producer * 100 + i));
            }
        })
    });
    for joined in join_all(producers).await {
        joined.unwrap();
    }

    let handled: usize = ledger.call("handled", ()).await.unwrap();
    assert_eq!(handled, 400);
    assert_eq!(overlap.overlaps.load(Ordering::SeqCst), 0);

    services.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_pin_on_closed_service_fails() {
    let services = inline_services();
    let ledger = services
        .new_service(Ledger {
            overlap: Arc::default(),
        })
        .build()
        .unwrap();
    ledger.close();

    let pinned = ledger.pin(Auditor {
        overlap: Arc::default(),
    });
    assert!(matches!(pinned, Err(Error::ActorClosed { .. })));
}
