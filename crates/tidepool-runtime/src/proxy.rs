//! Typed proxies
//!
//! TigerStyle: Proxy tables validated once per (proxy, actor) pair, then
//! cached.
//!
//! A proxy is a struct generated by [`proxy!`](crate::proxy!) whose methods
//! turn calls into send, query or pipe messages. Binding a proxy to a
//! service checks that the actor registered every method with the same
//! kind and resolves each to a method slot, so later calls skip the name
//! lookup.
//!
//! ```rust,ignore
//! tidepool_runtime::proxy! {
//!     pub struct CounterApi {
//!         send fn add(amount: u64);
//!         query fn total() -> u64;
//!         pipe fn history() -> u64;
//!     }
//! }
//!
//! let api: CounterApi = counter.as_proxy()?;
//! api.add(5);
//! api.total(Reply::new(|total| println!("{:?}", total)));
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tidepool_core::error::{Error, Result};
use tidepool_core::reply::Reply;
use tracing::debug;

use crate::method::{MethodDirectory, MethodKind};
use crate::pipe::{PipeFlow, PipeSubscriber};
use crate::service::ServiceRef;

/// A typed view over a service
pub trait Proxy: Sized + 'static {
    /// Interface name used in errors
    const INTERFACE: &'static str;

    /// Methods in declaration order
    fn methods() -> &'static [(&'static str, MethodKind)];

    /// Wrap a validated binding
    fn bind(binding: ProxyBinding) -> Self;
}

#[derive(Debug, Clone, Copy)]
struct ProxySlot {
    name: &'static str,
    slot: usize,
    direct: bool,
}

/// Interface method index to actor method slot
#[derive(Debug)]
pub struct ProxyTable {
    interface: &'static str,
    slots: Vec<ProxySlot>,
}

impl ProxyTable {
    fn build<P: Proxy>(directory: &MethodDirectory) -> Result<Self> {
        let unavailable = |reason: String| Error::ProxyUnavailable {
            interface: P::INTERFACE.to_string(),
            reason,
        };

        let mut slots = Vec::with_capacity(P::methods().len());
        for &(name, kind) in P::methods() {
            let info = directory.get(name).ok_or_else(|| {
                unavailable(format!("{} has no method {}", directory.type_name(), name))
            })?;
            if info.kind != kind {
                return Err(unavailable(format!(
                    "{}::{} is a {} method, not {}",
                    directory.type_name(),
                    name,
                    info.kind,
                    kind
                )));
            }
            slots.push(ProxySlot {
                name,
                slot: info.slot,
                direct: info.direct,
            });
        }

        Ok(Self {
            interface: P::INTERFACE,
            slots,
        })
    }

    /// Interface this table serves
    pub fn interface(&self) -> &'static str {
        self.interface
    }

    fn slot(&self, index: usize) -> &ProxySlot {
        // Indices come from the generated proxy, which matches `methods()`
        &self.slots[index]
    }
}

/// A service plus the validated table for one proxy type
#[derive(Clone)]
pub struct ProxyBinding {
    service: ServiceRef,
    table: Arc<ProxyTable>,
}

impl ProxyBinding {
    pub(crate) fn new(service: ServiceRef, table: Arc<ProxyTable>) -> Self {
        Self { service, table }
    }

    /// The bound service
    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    /// Send to the method at `index`
    pub fn send<P: Send + 'static>(&self, index: usize, args: P) -> bool {
        let slot = self.table.slot(index);
        self.service.send_slot(slot.name, slot.slot, slot.direct, args)
    }

    /// Query the method at `index`
    pub fn query<P, R>(&self, index: usize, args: P, reply: Reply<R>) -> bool
    where
        P: Send + 'static,
        R: Send + 'static,
    {
        let slot = self.table.slot(index);
        self.service
            .query_slot(slot.name, slot.slot, slot.direct, args, reply)
    }

    /// Start the pipe method at `index`
    pub fn pipe<P, T, S>(&self, index: usize, args: P, subscriber: S) -> PipeFlow
    where
        P: Send + 'static,
        T: Send + 'static,
        S: PipeSubscriber<T>,
    {
        let slot = self.table.slot(index);
        self.service.pipe_slot(slot.name, slot.slot, args, subscriber)
    }
}

impl fmt::Debug for ProxyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyBinding")
            .field("interface", &self.table.interface)
            .field("address", &self.service.address())
            .finish()
    }
}

/// Validated proxy tables, shared by every service of a manager
#[derive(Debug, Default)]
pub(crate) struct ProxyCache {
    tables: RwLock<HashMap<(TypeId, TypeId), Arc<ProxyTable>>>,
}

impl ProxyCache {
    /// Table for proxy `P` over the actor described by `directory`
    pub(crate) fn table<P: Proxy>(&self, directory: &MethodDirectory) -> Result<Arc<ProxyTable>> {
        let key = (TypeId::of::<P>(), directory.actor_type());
        if let Some(table) = self.tables.read().get(&key) {
            return Ok(table.clone());
        }

        let table = Arc::new(ProxyTable::build::<P>(directory)?);
        debug!(
            interface = P::INTERFACE,
            actor = directory.type_name(),
            methods = table.slots.len(),
            "Proxy table built"
        );
        Ok(self.tables.write().entry(key).or_insert(table).clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.tables.read().len()
    }
}

// =============================================================================
// proxy! macro
// =============================================================================

/// Declare a proxy struct
///
/// Each method is `send`, `query` or `pipe`, takes zero or one argument,
/// and maps to the actor method of the same name:
///
/// - `send fn name(arg: T);` becomes `fn name(&self, arg: T) -> bool`
/// - `query fn name(arg: T) -> R;` becomes
///   `fn name(&self, arg: T, reply: Reply<R>) -> bool`
/// - `pipe fn name(arg: T) -> Item;` becomes
///   `fn name<S: PipeSubscriber<Item>>(&self, arg: T, subscriber: S) -> PipeFlow`
#[macro_export]
macro_rules! proxy {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $kind:ident fn $method:ident ( $($arg:ident : $arg_ty:ty)? ) $(-> $ret:ty)? ; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            binding: $crate::ProxyBinding,
        }

        impl $crate::Proxy for $name {
            const INTERFACE: &'static str = stringify!($name);

            fn methods() -> &'static [(&'static str, $crate::MethodKind)] {
                &[ $( (stringify!($method), $crate::__proxy_kind!($kind)) ),* ]
            }

            fn bind(binding: $crate::ProxyBinding) -> Self {
                Self { binding }
            }
        }

        impl $name {
            /// The service behind this proxy
            pub fn service(&self) -> &$crate::ServiceRef {
                self.binding.service()
            }

            $crate::__proxy_methods!(0usize; $( $kind fn $method ( $($arg : $arg_ty)? ) $(-> $ret)? ; )*);
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __proxy_kind {
    (send) => {
        $crate::MethodKind::Send
    };
    (query) => {
        $crate::MethodKind::Query
    };
    (pipe) => {
        $crate::MethodKind::Pipe
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __proxy_args {
    () => {
        ()
    };
    ($arg:ident) => {
        $arg
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __proxy_methods {
    ($index:expr;) => {};
    ($index:expr; send fn $method:ident ( $($arg:ident : $arg_ty:ty)? ) ; $($rest:tt)*) => {
        pub fn $method(&self $(, $arg: $arg_ty)?) -> bool {
            self.binding.send($index, $crate::__proxy_args!($($arg)?))
        }

        $crate::__proxy_methods!($index + 1; $($rest)*);
    };
    ($index:expr; query fn $method:ident ( $($arg:ident : $arg_ty:ty)? ) -> $ret:ty ; $($rest:tt)*) => {
        pub fn $method(&self $(, $arg: $arg_ty)?, reply: $crate::Reply<$ret>) -> bool {
            self.binding.query($index, $crate::__proxy_args!($($arg)?), reply)
        }

        $crate::__proxy_methods!($index + 1; $($rest)*);
    };
    ($index:expr; pipe fn $method:ident ( $($arg:ident : $arg_ty:ty)? ) -> $item:ty ; $($rest:tt)*) => {
        pub fn $method<S: $crate::PipeSubscriber<$item>>(
            &self
            $(, $arg: $arg_ty)?,
            subscriber: S,
        ) -> $crate::PipeFlow {
            self.binding
                .pipe::<_, $item, S>($index, $crate::__proxy_args!($($arg)?), subscriber)
        }

        $crate::__proxy_methods!($index + 1; $($rest)*);
    };
}
