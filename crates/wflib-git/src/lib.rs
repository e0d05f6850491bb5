//! Git smart HTTP protocol handler for wflib
//!
//! Serves a single on-disk bare repository over git's smart HTTP protocol.
//! Fetch (git-upload-pack) is handled by [`http`]; push (git-receive-pack) is a
//! [`receive::ReceivePack`] session whose completion is reported to a
//! [`hook::PostReceiveHook`].

pub mod error;
pub mod hook;
pub mod http;
pub mod object;
pub mod pack;
pub mod protocol;
pub mod receive;
pub mod refs;
pub mod storage;

pub use error::{Error, Result};
pub use hook::{chain, PostReceiveHook, UpdateServerInfo};
pub use receive::{CommandResult, ReceiveCommand, ReceivePack};
pub use storage::GitStorage;
