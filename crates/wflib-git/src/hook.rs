//! Post-receive hooks
//!
//! A [`ReceivePack`] calls exactly one hook after it has applied a push.
//! Extra behaviour is layered on with [`chain`], which keeps the existing
//! hook and appends more after it instead of replacing it.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::receive::{ReceiveCommand, ReceivePack};

/// Called once per push, after ref updates are on disk. `commands` holds only
/// the commands that were applied successfully.
pub trait PostReceiveHook: Send + Sync {
    fn on_post_receive(&self, rp: &ReceivePack, commands: &[ReceiveCommand]);
}

impl<F> PostReceiveHook for F
where
    F: Fn(&ReceivePack, &[ReceiveCommand]) + Send + Sync,
{
    fn on_post_receive(&self, rp: &ReceivePack, commands: &[ReceiveCommand]) {
        self(rp, commands)
    }
}

/// Default hook: refresh `info/refs`, like git's `update-server-info`
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateServerInfo;

impl PostReceiveHook for UpdateServerInfo {
    fn on_post_receive(&self, rp: &ReceivePack, _commands: &[ReceiveCommand]) {
        match rp.storage().update_server_info() {
            Ok(()) => debug!("info/refs refreshed"),
            Err(e) => warn!(error = %e, "failed to refresh info/refs"),
        }
    }
}

struct Chain {
    before: Arc<dyn PostReceiveHook>,
    after: Vec<Arc<dyn PostReceiveHook>>,
}

impl PostReceiveHook for Chain {
    fn on_post_receive(&self, rp: &ReceivePack, commands: &[ReceiveCommand]) {
        self.before.on_post_receive(rp, commands);
        for hook in &self.after {
            hook.on_post_receive(rp, commands);
        }
    }
}

/// Compose hooks: `before` always runs first, then each of `after` in order
pub fn chain(
    before: Arc<dyn PostReceiveHook>,
    after: Vec<Arc<dyn PostReceiveHook>>,
) -> Arc<dyn PostReceiveHook> {
    if after.is_empty() {
        return before;
    }
    Arc::new(Chain { before, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitStorage;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn PostReceiveHook> {
        let log = log.clone();
        Arc::new(move |_: &ReceivePack, _: &[ReceiveCommand]| log.lock().unwrap().push(name))
    }

    #[test]
    fn test_chain_runs_before_first() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(GitStorage::init_bare(dir.path().join("repo.git")).unwrap());
        let rp = ReceivePack::new(storage);
        let log = Arc::new(Mutex::new(Vec::new()));

        let hook = chain(
            recorder(&log, "base"),
            vec![recorder(&log, "first"), recorder(&log, "second")],
        );
        hook.on_post_receive(&rp, &[]);

        assert_eq!(*log.lock().unwrap(), vec!["base", "first", "second"]);
    }

    #[test]
    fn test_chain_without_extras_is_identity() {
        let base: Arc<dyn PostReceiveHook> = Arc::new(UpdateServerInfo);
        let chained = chain(base.clone(), Vec::new());
        assert!(Arc::ptr_eq(&base, &chained));
    }
}
