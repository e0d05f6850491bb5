//! Push Gateway
//!
//! The only way to change the managed repository over the network. A push
//! goes through [`PushGateway::open_receive_session`]:
//!
//! 1. `authorize_push` rejects anyone without administrative capability
//! 2. `ensure_repository_initialized` creates an empty bare repository on first use
//! 3. `create_session` chains listener dispatch after the protocol's own
//!    post-receive hook
//!
//! Fetches read the repository as it is and never create it.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wflib_git::http::{advertise_refs, upload_pack, Service};
use wflib_git::{chain, GitStorage, PostReceiveHook, ReceivePack};

use crate::access::{AccessControl, Identity};
use crate::listener::{ListenerDispatch, ListenerRegistry};
use crate::store::RepositoryStore;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{identity} is not permitted to push")]
    Authorization { identity: Identity },

    #[error("failed to initialize repository at {}: {reason}", .path.display())]
    Initialization { path: PathBuf, reason: String },

    #[error("repository at {} has not been created yet", .0.display())]
    NotInitialized(PathBuf),

    #[error(transparent)]
    Git(#[from] wflib_git::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

pub struct PushGateway {
    store: RepositoryStore,
    access: Arc<dyn AccessControl>,
    listeners: Arc<ListenerRegistry>,
    /// Held only while checking for and creating the repository
    init_lock: Mutex<()>,
}

impl PushGateway {
    pub fn new(
        data_root: impl Into<PathBuf>,
        access: Arc<dyn AccessControl>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            store: RepositoryStore::new(data_root),
            access,
            listeners,
            init_lock: Mutex::new(()),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn resolve_repository_root(&self) -> PathBuf {
        self.store.repository_root()
    }

    #[instrument(skip(self), fields(%identity))]
    pub fn authorize_push(&self, identity: &Identity) -> Result<()> {
        if self.access.is_administrator(identity) {
            return Ok(());
        }
        warn!("push rejected: not an administrator");
        Err(GatewayError::Authorization {
            identity: identity.clone(),
        })
    }

    /// Create an empty bare repository if there is none yet.
    ///
    /// An existing repository is left alone. An empty directory is replaced.
    /// Anything else at the path is an error; its contents are never adopted.
    /// The repository is built in a sibling temporary directory and renamed
    /// into place, so a failure leaves nothing behind.
    pub fn ensure_repository_initialized(&self) -> Result<()> {
        let root = self.resolve_repository_root();
        let _guard = self.init_lock.lock();

        if GitStorage::is_bare_repository(&root) {
            return Ok(());
        }
        let init_error = |reason: String| GatewayError::Initialization {
            path: root.clone(),
            reason,
        };

        let replace_empty = if self.store.exists(&root) {
            if !is_empty_dir(&root).map_err(|e| init_error(e.to_string()))? {
                return Err(init_error(
                    "path exists and is not a bare git repository".to_string(),
                ));
            }
            true
        } else {
            false
        };

        self.store
            .ensure_parent_directories(&root)
            .map_err(|e| init_error(e.to_string()))?;
        let parent = root.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".workflow-libs-init-")
            .tempdir_in(parent)
            .map_err(|e| init_error(e.to_string()))?;
        GitStorage::init_bare(staging.path()).map_err(|e| init_error(e.to_string()))?;

        if replace_empty {
            fs::remove_dir(&root).map_err(|e| init_error(e.to_string()))?;
        }
        fs::rename(staging.path(), &root).map_err(|e| init_error(e.to_string()))?;

        info!(path = %root.display(), "created workflow library repository");
        Ok(())
    }

    /// Layer listener dispatch over whatever post-receive hook the session
    /// already has. The existing hook keeps running first.
    pub fn create_session(&self, mut session: ReceivePack) -> ReceivePack {
        let dispatch: Arc<dyn PostReceiveHook> =
            Arc::new(ListenerDispatch::new(self.listeners.clone()));
        session.set_post_receive_hook(chain(session.post_receive_hook(), vec![dispatch]));
        session
    }

    /// Authorize, create the repository if needed, and hand back a session
    /// ready to accept a push
    #[instrument(skip(self), fields(%identity))]
    pub fn open_receive_session(&self, identity: &Identity) -> Result<ReceivePack> {
        self.authorize_push(identity)?;
        self.ensure_repository_initialized()?;
        let storage = GitStorage::open(self.resolve_repository_root())?;
        Ok(self.create_session(ReceivePack::new(Arc::new(storage))))
    }

    /// The repository if it exists; reads never create it
    pub fn open_repository(&self) -> Result<Option<GitStorage>> {
        let root = self.resolve_repository_root();
        if !GitStorage::is_bare_repository(&root) {
            return Ok(None);
        }
        Ok(Some(GitStorage::open(root)?))
    }

    /// GET info/refs. Advertising receive-pack is the start of a push and is
    /// gated the same way.
    #[instrument(skip(self), fields(%identity, service = service.as_str()))]
    pub fn advertise(&self, service: Service, identity: &Identity) -> Result<Vec<u8>> {
        match service {
            Service::ReceivePack => {
                self.authorize_push(identity)?;
                self.ensure_repository_initialized()?;
                let storage = GitStorage::open(self.resolve_repository_root())?;
                Ok(advertise_refs(Some(&storage), service)?)
            }
            Service::UploadPack => {
                let storage = self.open_repository()?;
                Ok(advertise_refs(storage.as_ref(), service)?)
            }
        }
    }

    /// POST git-receive-pack
    #[instrument(skip(self, body), fields(%identity, bytes = body.len()))]
    pub fn receive(&self, identity: &Identity, body: &[u8]) -> Result<Vec<u8>> {
        let session = self.open_receive_session(identity)?;
        let response = session.receive(body)?;
        debug!("push processed");
        Ok(response)
    }

    /// POST git-upload-pack
    pub fn upload(&self, body: &[u8]) -> Result<Vec<u8>> {
        let storage = self
            .open_repository()?
            .ok_or_else(|| GatewayError::NotInitialized(self.resolve_repository_root()))?;
        Ok(upload_pack(&storage, body)?)
    }
}

fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_none())
}
