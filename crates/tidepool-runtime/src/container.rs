//! Child actor container
//!
//! TigerStyle: Bounded LRU with explicit growth limit, dirty list drained
//! on every save.
//!
//! Every actor carries a container for the children it resolves through
//! `lookup`. The container is part of the actor cell, so it is only touched
//! by the actor's own messages and needs no lock.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tidepool_core::config::ContainerConfig;
use tidepool_core::reply::Reply;
use tracing::{debug, warn};

use crate::lifecycle::ShutdownMode;
use crate::service::ServiceRef;

/// Children of one actor, keyed by lookup path
pub struct ActorContainer {
    children: LruCache<String, ServiceRef>,
    capacity_max: NonZeroUsize,
    /// Children changed since the last save
    modified: Vec<ServiceRef>,
    high_water: usize,
    /// An out-of-band save was issued and has not run yet
    ///
    /// Shared with the save's reply, which clears it when the save fails
    /// before draining the dirty list.
    save_requested: Arc<AtomicBool>,
}

impl ActorContainer {
    pub(crate) fn new(config: &ContainerConfig) -> Self {
        let initial = NonZeroUsize::new(config.children_count_initial).unwrap_or(NonZeroUsize::MIN);
        let capacity_max = NonZeroUsize::new(config.children_count_max)
            .unwrap_or(NonZeroUsize::MIN)
            .max(initial);
        debug_assert!(config.modified_high_water > 0);

        Self {
            children: LruCache::new(initial),
            capacity_max,
            modified: Vec::new(),
            high_water: config.modified_high_water,
            save_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a child under `path`
    ///
    /// The cache doubles in size when full, up to the configured maximum;
    /// past that the least recently used child is evicted and returned.
    /// A child leaving the container is closed (saved first when dirty), so
    /// a later lookup of its path never finds two live actors at one address.
    pub fn add_service(&mut self, path: impl Into<String>, service: ServiceRef) -> Option<ServiceRef> {
        let path = path.into();
        if !self.children.contains(&path) && self.children.len() >= self.children.cap().get() {
            self.grow();
        }

        let (old_path, old) = self.children.push(path.clone(), service.clone())?;
        if old == service {
            return None;
        }
        if old_path != path {
            debug!(path = %old_path, child = %old.address(), "Child evicted from container");
        }
        self.retire(&old);
        Some(old)
    }

    /// Close a child that left the container
    fn retire(&mut self, child: &ServiceRef) {
        let dirty = self.modified.len();
        self.modified.retain(|modified| modified != child);

        if self.modified.len() < dirty {
            let address = child.address().to_string();
            child.save(Reply::new(move |result: tidepool_core::Result<()>| {
                if let Err(e) = result {
                    warn!(address = %address, error = %e, "Save before eviction failed");
                }
            }));
        }
        // Queued after the save, so the checkpoint runs first
        child.shutdown(ShutdownMode::Graceful);
    }

    /// Find a child, marking it recently used
    pub fn get_service(&mut self, path: &str) -> Option<ServiceRef> {
        self.children.get(path).cloned()
    }

    /// Number of cached children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when no children are cached
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Current cache capacity
    pub fn capacity(&self) -> usize {
        self.children.cap().get()
    }

    /// Children waiting for the next save
    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }

    fn grow(&mut self) {
        let capacity = self.children.cap();
        if capacity >= self.capacity_max {
            return;
        }
        let next = NonZeroUsize::new(capacity.get().saturating_mul(2))
            .unwrap_or(self.capacity_max)
            .min(self.capacity_max);
        self.children.resize(next);
        debug!(capacity = next.get(), "Container grown");
    }

    /// Add a child to the dirty list
    ///
    /// Past the high-water mark one save of `owner` is requested; it is
    /// not requested again until that save drains the list.
    pub(crate) fn add_modified_child(&mut self, child: ServiceRef, owner: &ServiceRef) {
        if self
            .modified
            .iter()
            .any(|modified| modified.address() == child.address())
        {
            return;
        }
        self.modified.push(child);

        if self.modified.len() > self.high_water && !self.save_requested.swap(true, Ordering::AcqRel) {
            debug!(
                address = %owner.address(),
                modified = self.modified.len(),
                "Modified children past high water, requesting save"
            );
            let address = owner.address().to_string();
            let pending = Arc::clone(&self.save_requested);
            owner.save(Reply::new(move |result: tidepool_core::Result<()>| {
                if let Err(e) = result {
                    // The dirty list was not drained; allow the next request
                    pending.store(false, Ordering::Release);
                    warn!(address = %address, error = %e, "Requested save failed");
                }
            }));
        }
    }

    /// Save every dirty child, completing `reply` once all of them finished
    pub(crate) fn on_save(&mut self, reply: Reply<()>) {
        self.save_requested.store(false, Ordering::Release);
        let dirty = std::mem::take(&mut self.modified);
        if dirty.is_empty() {
            return reply.ok(());
        }

        let branches = reply.of(|_: Vec<()>| ()).fork(dirty.len());
        for (child, branch) in dirty.into_iter().zip(branches) {
            child.save(branch);
        }
    }

    /// Shut every child down and forget them
    pub(crate) fn shutdown_children(&mut self, mode: ShutdownMode) {
        for (path, child) in self.children.iter() {
            debug!(path = %path, child = %child.address(), "Shutting down child");
            child.shutdown(mode);
        }
        self.children.clear();
        self.modified.clear();
    }
}

impl std::fmt::Debug for ActorContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContainer")
            .field("children", &self.children.len())
            .field("capacity", &self.children.cap())
            .field("modified", &self.modified.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tidepool_core::config::DeliveryStrategy;
    use tidepool_core::executor::InlineExecutor;

    use crate::actor::Actor;
    use crate::method::MethodTable;
    use crate::services::Services;

    struct Leaf;

    impl Actor for Leaf {
        fn methods(_table: &mut MethodTable<Self>) {}
    }

    fn leaves(count: usize) -> Vec<ServiceRef> {
        let services = Services::builder()
            .executor(Arc::new(InlineExecutor))
            .build()
            .unwrap();
        (0..count)
            .map(|i| {
                services
                    .new_service(Leaf)
                    .address(format!("/leaf/{}", i))
                    .strategy(DeliveryStrategy::Direct)
                    .build()
                    .unwrap()
            })
            .collect()
    }

    fn config(initial: usize, max: usize) -> ContainerConfig {
        ContainerConfig {
            children_count_initial: initial,
            children_count_max: max,
            modified_high_water: 8,
        }
    }

    #[test]
    fn test_container_grows_then_evicts() {
        let mut container = ActorContainer::new(&config(2, 4));
        let children = leaves(5);

        for (i, child) in children.iter().take(4).enumerate() {
            assert!(container.add_service(format!("c{}", i), child.clone()).is_none());
        }
        assert_eq!(container.capacity(), 4);
        assert_eq!(container.len(), 4);

        // Touch c0 so c1 is least recently used
        assert!(container.get_service("c0").is_some());
        let evicted = container.add_service("c4", children[4].clone()).unwrap();
        assert_eq!(evicted.address(), "/leaf/1");
        assert!(evicted.is_closed());
        assert!(container.get_service("c1").is_none());
        assert_eq!(container.len(), 4);
        assert!(!children[0].is_closed());
    }

    #[test]
    fn test_evicted_child_leaves_dirty_list() {
        let mut container = ActorContainer::new(&config(1, 1));
        let children = leaves(3);
        let owner = children[2].clone();

        container.add_service("a", children[0].clone());
        container.add_modified_child(children[0].clone(), &owner);
        assert_eq!(container.modified_count(), 1);

        container.add_service("b", children[1].clone());
        assert!(children[0].is_closed());
        assert_eq!(container.modified_count(), 0);
    }

    #[test]
    fn test_re_adding_same_child_keeps_it_open() {
        let mut container = ActorContainer::new(&config(2, 2));
        let children = leaves(1);

        container.add_service("a", children[0].clone());
        assert!(container.add_service("a", children[0].clone()).is_none());
        assert!(!children[0].is_closed());
    }

    #[test]
    fn test_failed_high_water_save_allows_another_request() {
        let mut container = ActorContainer::new(&ContainerConfig {
            modified_high_water: 1,
            ..config(2, 4)
        });
        let children = leaves(4);
        let owner = children[3].clone();
        owner.shutdown(ShutdownMode::Immediate);

        // Past high water on a closed owner: the save fails at once
        container.add_modified_child(children[0].clone(), &owner);
        container.add_modified_child(children[1].clone(), &owner);
        assert!(!container.save_requested.load(Ordering::Acquire));
        container.add_modified_child(children[2].clone(), &owner);
        assert!(!container.save_requested.load(Ordering::Acquire));
        assert_eq!(container.modified_count(), 3);
    }

    #[test]
    fn test_container_replace_same_path() {
        let mut container = ActorContainer::new(&config(2, 2));
        let children = leaves(2);

        assert!(container.add_service("a", children[0].clone()).is_none());
        let replaced = container.add_service("a", children[1].clone()).unwrap();
        assert_eq!(replaced.address(), "/leaf/0");
        assert_eq!(container.get_service("a").unwrap().address(), "/leaf/1");
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_modified_children_deduplicated() {
        let mut container = ActorContainer::new(&config(2, 4));
        let children = leaves(3);
        let owner = children[2].clone();

        container.add_modified_child(children[0].clone(), &owner);
        container.add_modified_child(children[0].clone(), &owner);
        container.add_modified_child(children[1].clone(), &owner);
        assert_eq!(container.modified_count(), 2);
    }

    #[test]
    fn test_on_save_with_no_dirty_children_completes() {
        let mut container = ActorContainer::new(&config(2, 4));
        let (reply, rx) = Reply::channel();
        container.on_save(reply);
        assert!(rx.blocking_recv().is_ok());
    }
}
