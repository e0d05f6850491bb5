//! Listener Registry
//!
//! Components that want to know when the managed repository changed register
//! a [`RepositoryListener`] here. Pushes notify them through
//! [`ListenerDispatch`], which is chained after the protocol's own
//! post-receive hook.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use wflib_git::{PostReceiveHook, ReceiveCommand, ReceivePack};

/// Notified after a push has been applied. The repository already reflects
/// the push when this is called; listeners read what they need from it.
pub trait RepositoryListener: Send + Sync {
    fn repository_updated(&self) -> anyhow::Result<()>;

    /// Label used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> RepositoryListener for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn repository_updated(&self) -> anyhow::Result<()> {
        self()
    }
}

/// Handle returned by [`ListenerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn RepositoryListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn RepositoryListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, listener = listener.name(), "registered repository listener");
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            debug!(%id, "deregistered repository listener");
        }
        removed
    }

    /// Snapshot of the listeners in registration order. Later registrations
    /// and removals do not affect an enumeration already taken.
    pub fn current_listeners(&self) -> std::vec::IntoIter<Arc<dyn RepositoryListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

/// Post-receive hook that fans a push out to every registered listener.
///
/// A listener that errors or panics is logged and skipped; the rest still run
/// and the push result is unaffected.
#[derive(Clone)]
pub struct ListenerDispatch {
    registry: Arc<ListenerRegistry>,
}

impl ListenerDispatch {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke every current listener; returns how many failed
    pub fn dispatch(&self) -> usize {
        let mut failed = 0;
        for listener in self.registry.current_listeners() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.repository_updated()));
            match outcome {
                Ok(Ok(())) => debug!(listener = listener.name(), "listener notified"),
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(listener = listener.name(), error = %format!("{:#}", e), "repository listener failed");
                }
                Err(_) => {
                    failed += 1;
                    error!(listener = listener.name(), "repository listener panicked");
                }
            }
        }
        failed
    }
}

impl PostReceiveHook for ListenerDispatch {
    fn on_post_receive(&self, _rp: &ReceivePack, commands: &[ReceiveCommand]) {
        // Every command was rejected, so the repository is unchanged and
        // listeners have nothing to reload. git skips post-receive likewise.
        if commands.is_empty() {
            debug!("no refs changed; listeners not notified");
            return;
        }
        let failed = self.dispatch();
        debug!(refs = commands.len(), failed, "repository listeners dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn RepositoryListener> {
        let log = log.clone();
        Arc::new(move || -> anyhow::Result<()> {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording(&log, "a"));
        registry.register(recording(&log, "b"));
        registry.register(recording(&log, "c"));

        assert_eq!(ListenerDispatch::new(registry).dispatch(), 0);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deregister() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.register(recording(&log, "a"));
        registry.register(recording(&log, "b"));

        assert!(registry.deregister(a));
        assert!(!registry.deregister(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_ignores_later_registration() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording(&log, "a"));

        let snapshot = registry.current_listeners();
        registry.register(recording(&log, "late"));

        assert_eq!(snapshot.count(), 1);
        assert_eq!(registry.current_listeners().count(), 2);
    }

    #[test]
    fn test_failures_are_isolated() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording(&log, "first"));
        registry.register(Arc::new(|| -> anyhow::Result<()> { anyhow::bail!("rebuild failed") }));
        registry.register(Arc::new(|| -> anyhow::Result<()> { panic!("listener bug") }));
        registry.register(recording(&log, "last"));

        assert_eq!(ListenerDispatch::new(registry).dispatch(), 2);
        assert_eq!(*log.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_registration_from_inside_a_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = registry.clone();
        registry.register(Arc::new(move || -> anyhow::Result<()> {
            inner.register(Arc::new(|| -> anyhow::Result<()> { Ok(()) }));
            Ok(())
        }));

        ListenerDispatch::new(registry.clone()).dispatch();
        assert_eq!(registry.len(), 2);
    }
}
