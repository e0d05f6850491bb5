pub mod access;
pub mod config;
pub mod gateway;
pub mod listener;
pub mod server;
pub mod store;

pub use access::{AccessControl, Identity, StaticAccessControl};
pub use config::Config;
pub use gateway::{GatewayError, PushGateway};
pub use listener::{ListenerDispatch, ListenerId, ListenerRegistry, RepositoryListener};
pub use server::WflibServer;
pub use store::{RepositoryStore, REPOSITORY_DIR_NAME};
pub use wflib_git::GitStorage;
