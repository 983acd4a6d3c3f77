//! Service manager
//!
//! TigerStyle: One registry per manager, explicit limits, validated
//! addresses.
//!
//! [`Services`] owns the address map, the proxy table cache and the
//! collaborators every inbox shares (executor, clock, journals). Services
//! are created through [`ServiceBuilder`], which picks the delivery strategy
//! and inbox settings.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tidepool_core::config::{DeliveryStrategy, InboxConfig, OverflowPolicy, RuntimeConfig};
use tidepool_core::constants::{SERVICES_COUNT_MAX, SERVICE_ADDRESS_LENGTH_BYTES_MAX};
use tidepool_core::error::{Error, Result};
use tidepool_core::executor::{Executor, TokioExecutor};
use tidepool_core::io::{TimeProvider, WallClockTime};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::actor::{Actor, ActorFactory, ActorStub, ChildActor, Stub};
use crate::inbox::{CellFactory, DeliveryKind, Inbox, InboxParts};
use crate::journal::{Journal, JournalProvider, MemoryJournalProvider};
use crate::lifecycle::{ActorCell, ShutdownMode};
use crate::method::{MethodDirectory, MethodTable};
use crate::proxy::ProxyCache;
use crate::service::ServiceRef;

/// Journal opened when a service does not name one
const JOURNAL_NAME_DEFAULT: &str = "default";

pub(crate) struct ServicesInner {
    id: Uuid,
    config: RuntimeConfig,
    executor: Arc<dyn Executor>,
    time: Arc<dyn TimeProvider>,
    journals: Arc<dyn JournalProvider>,
    services: RwLock<HashMap<String, ServiceRef>>,
    proxies: ProxyCache,
    closed: AtomicBool,
}

/// The service manager
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Services {
    inner: Arc<ServicesInner>,
}

impl Services {
    pub(crate) fn from_inner(inner: Arc<ServicesInner>) -> Self {
        Self { inner }
    }

    /// Start configuring a manager
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }

    /// Manager with default settings on the current tokio runtime
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The manager of the service running on this call stack
    pub fn current() -> Option<Services> {
        ServiceRef::current().and_then(|service| service.manager())
    }

    /// Unique manager id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Executor running inbox workers
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    /// Register a service backed by one actor instance
    pub fn new_service<A: Actor>(&self, actor: A) -> ServiceBuilder<A> {
        ServiceBuilder::new(self.clone(), Source::Instance(actor))
    }

    /// Register a service whose messages run on instances from `factory`
    ///
    /// Uses the Spawn strategy unless the builder picks another one, in
    /// which case a single instance is created.
    pub fn new_pool<A, F>(&self, factory: F) -> ServiceBuilder<A>
    where
        A: Actor,
        F: ActorFactory<A>,
    {
        ServiceBuilder::new(self.clone(), Source::Factory(Arc::new(factory)))
            .strategy(DeliveryStrategy::Spawn)
    }

    /// Find a registered service
    pub fn service(&self, address: &str) -> Result<ServiceRef> {
        self.inner
            .services
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::service_not_found(address))
    }

    /// Number of registered services
    pub fn service_count(&self) -> usize {
        self.inner.services.read().len()
    }

    /// Number of cached proxy tables
    pub fn proxy_table_count(&self) -> usize {
        self.inner.proxies.len()
    }

    /// Check whether the manager was shut down
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut every registered service down
    #[instrument(skip(self), fields(services_id = %self.inner.id), level = "info")]
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let services: Vec<ServiceRef> = self
            .inner
            .services
            .write()
            .drain()
            .map(|(_, service)| service)
            .collect();

        info!(count = services.len(), mode = %mode, "Shutting down services");
        for service in services {
            service.shutdown(mode);
        }
    }

    pub(crate) fn proxies(&self) -> &ProxyCache {
        &self.inner.proxies
    }

    /// Forget `service` if it is the one registered at its address
    pub(crate) fn unregister(&self, service: &ServiceRef) {
        let mut services = self.inner.services.write();
        if services.get(service.address()) == Some(service) {
            services.remove(service.address());
        }
    }

    /// Build a queued child of `parent`, started and not registered
    pub(crate) fn create_child(
        &self,
        parent: &Arc<Inbox>,
        path: &str,
        child: ChildActor,
    ) -> Result<ServiceRef> {
        let address = format!("{}/{}", parent.address(), path);
        validate_address(&address)?;

        let stub = child.into_stub();
        let directory = stub.directory().clone();
        let cell = ActorCell::new(stub, &self.inner.config.container);
        let config = InboxConfig {
            strategy: DeliveryStrategy::Queue,
            ..parent.config().clone()
        };

        let parts = self.parts(
            address,
            config,
            directory,
            Some(Arc::downgrade(parent)),
            parent.journal().clone(),
        );
        let service = ServiceRef::from_inbox(Inbox::new(parts, DeliveryKind::Queue(cell)));
        service.start();
        Ok(service)
    }

    fn parts(
        &self,
        address: String,
        config: InboxConfig,
        directory: Arc<MethodDirectory>,
        parent: Option<Weak<Inbox>>,
        journal: Arc<dyn Journal>,
    ) -> InboxParts {
        InboxParts {
            address,
            config,
            directory,
            manager: Arc::downgrade(&self.inner),
            parent,
            journal,
            time: self.inner.time.clone(),
            executor: self.inner.executor.clone(),
            container: self.inner.config.container.clone(),
            pipe: self.inner.config.pipe.clone(),
        }
    }

    fn register(&self, service: ServiceRef) -> Result<ServiceRef> {
        if self.is_closed() {
            return Err(Error::illegal_state("service manager is shut down"));
        }

        let mut services = self.inner.services.write();
        if services.contains_key(service.address()) {
            return Err(Error::ServiceAlreadyExists {
                address: service.address().to_string(),
            });
        }
        if services.len() >= SERVICES_COUNT_MAX {
            return Err(Error::illegal_state(format!(
                "service count limit {} reached",
                SERVICES_COUNT_MAX
            )));
        }
        services.insert(service.address().to_string(), service.clone());
        Ok(service)
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("id", &self.inner.id)
            .field("executor", &self.inner.executor.name())
            .field("services", &self.service_count())
            .finish()
    }
}

/// Check a service address against the naming rules
fn validate_address(address: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if address.len() > SERVICE_ADDRESS_LENGTH_BYTES_MAX {
        return Err(invalid("too long"));
    }
    if !address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/-_.:#@".contains(c))
    {
        return Err(invalid("only ASCII alphanumerics and /-_.:#@ are allowed"));
    }
    Ok(())
}

// =============================================================================
// ServicesBuilder
// =============================================================================

/// Configures a [`Services`] manager
#[derive(Default)]
pub struct ServicesBuilder {
    config: Option<RuntimeConfig>,
    executor: Option<Arc<dyn Executor>>,
    time: Option<Arc<dyn TimeProvider>>,
    journals: Option<Arc<dyn JournalProvider>>,
}

impl ServicesBuilder {
    /// Runtime configuration (validated on build)
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Executor for inbox workers; defaults to the current tokio runtime
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Clock for message timestamps and expiry
    pub fn time(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = Some(time);
        self
    }

    /// Where services' journals come from; defaults to in-memory journals
    pub fn journal_provider(mut self, journals: Arc<dyn JournalProvider>) -> Self {
        self.journals = Some(journals);
        self
    }

    /// Build the manager
    pub fn build(self) -> Result<Services> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(TokioExecutor::current()?),
        };
        let time = self.time.unwrap_or_else(|| Arc::new(WallClockTime::new()));
        let journals = self
            .journals
            .unwrap_or_else(|| Arc::new(MemoryJournalProvider::new()));

        let inner = ServicesInner {
            id: Uuid::new_v4(),
            config,
            executor,
            time,
            journals,
            services: RwLock::new(HashMap::new()),
            proxies: ProxyCache::default(),
            closed: AtomicBool::new(false),
        };
        info!(
            services_id = %inner.id,
            executor = inner.executor.name(),
            strategy = %inner.config.inbox.strategy,
            "Service manager created"
        );
        Ok(Services::from_inner(Arc::new(inner)))
    }
}

impl fmt::Debug for ServicesBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicesBuilder")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish()
    }
}

// =============================================================================
// ServiceBuilder
// =============================================================================

enum Source<A: Actor> {
    Instance(A),
    Factory(Arc<dyn ActorFactory<A>>),
}

/// Configures one service before it is registered
pub struct ServiceBuilder<A: Actor> {
    services: Services,
    source: Source<A>,
    address: Option<String>,
    config: InboxConfig,
    journal: Option<Arc<dyn Journal>>,
    start: bool,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Actor> ServiceBuilder<A> {
    fn new(services: Services, source: Source<A>) -> Self {
        let config = services.inner.config.inbox.clone();
        Self {
            services,
            source,
            address: None,
            config,
            journal: None,
            start: true,
            _marker: PhantomData,
        }
    }

    /// Address to register under; defaults to `/anonymous/{uuid}`
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Delivery strategy
    pub fn strategy(mut self, strategy: DeliveryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Queue capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Overflow policy for a full queue
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.config.overflow = overflow;
        self
    }

    /// How long a Block-policy offer waits; `Duration::MAX` waits forever
    pub fn offer_timeout(mut self, timeout: Duration) -> Self {
        self.config.offer_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Concurrent instances of a Spawn service
    pub fn spawn_concurrency(mut self, count: usize) -> Self {
        self.config.spawn_concurrency_max = count;
        self
    }

    /// Messages a worker drains per turn
    pub fn batch_count(mut self, count: usize) -> Self {
        self.config.batch_count_max = count;
        self
    }

    /// Journal for checkpoints; defaults to the provider's `default` journal
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Whether to start the service on build (default true)
    pub fn auto_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    /// Create, register and (by default) start the service
    pub fn build(self) -> Result<ServiceRef> {
        self.config.validate()?;

        let address = match self.address {
            Some(address) => address,
            None => format!("/anonymous/{}", Uuid::new_v4()),
        };
        validate_address(&address)?;

        let services = self.services;
        let journal = match self.journal {
            Some(journal) => journal,
            None => services.inner.journals.open_journal(JOURNAL_NAME_DEFAULT)?,
        };

        let table = Arc::new(MethodTable::<A>::build());
        let directory = Arc::new(table.directory());
        let container = services.inner.config.container.clone();
        let strategy = self.config.strategy;

        let kind = match (strategy, self.source) {
            (DeliveryStrategy::Spawn, Source::Factory(factory)) => {
                let directory = directory.clone();
                let cell_factory: CellFactory = Box::new(move || {
                    let stub = Stub::with_directory(factory.create(), table.clone(), directory.clone());
                    ActorCell::new(Box::new(stub), &container)
                });
                DeliveryKind::Spawn(cell_factory)
            }
            (DeliveryStrategy::Spawn, Source::Instance(_)) => {
                return Err(Error::illegal_argument(format!(
                    "{}: spawn services need a factory, use new_pool",
                    address
                )));
            }
            (strategy, source) => {
                let actor = match source {
                    Source::Instance(actor) => actor,
                    Source::Factory(factory) => factory.create(),
                };
                let stub: Box<dyn ActorStub> =
                    Box::new(Stub::with_directory(actor, table, directory.clone()));
                let cell = ActorCell::new(stub, &container);
                match strategy {
                    DeliveryStrategy::Direct => DeliveryKind::Direct(cell),
                    _ => DeliveryKind::Queue(cell),
                }
            }
        };

        let parts = services.parts(address, self.config, directory, None, journal);
        let service = services.register(ServiceRef::from_inbox(Inbox::new(parts, kind)))?;
        debug!(address = %service.address(), strategy = %strategy, "Service registered");

        if self.start {
            service.start();
        }
        Ok(service)
    }
}

impl<A: Actor> fmt::Debug for ServiceBuilder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("start", &self.start)
            .finish()
    }
}
