mod auth;
mod git;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::access::StaticAccessControl;
use crate::gateway::PushGateway;

pub use auth::{AuthState, REALM};

pub const DEFAULT_URL_NAME: &str = "workflowLibs.git";

/// Mounts the managed repository at `/<url_name>` on its own listener
pub struct WflibServer {
    gateway: Arc<PushGateway>,
    accounts: Arc<StaticAccessControl>,
    url_name: String,
    addr: String,
}

impl WflibServer {
    pub fn new(gateway: Arc<PushGateway>, addr: String) -> Self {
        Self {
            gateway,
            accounts: Arc::new(StaticAccessControl::new()),
            url_name: DEFAULT_URL_NAME.to_string(),
            addr,
        }
    }

    /// Accounts used to turn Basic credentials into an identity
    pub fn with_accounts(mut self, accounts: Arc<StaticAccessControl>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn with_url_name(mut self, url_name: impl Into<String>) -> Self {
        self.url_name = url_name.into().trim_matches('/').to_string();
        self
    }

    pub fn router(&self) -> Router {
        let base = format!("/{}", self.url_name);
        let git_state = git::GitState {
            gateway: self.gateway.clone(),
        };
        let auth_state = AuthState {
            accounts: self.accounts.clone(),
        };

        Router::new()
            .route(&format!("{}/info/refs", base), get(git::info_refs))
            .route(&format!("{}/git-upload-pack", base), post(git::upload_pack))
            .route(&format!("{}/git-receive-pack", base), post(git::receive_pack))
            .layer(middleware::from_fn_with_state(auth_state, auth::identify))
            .layer(DefaultBodyLimit::max(1024 * 1024 * 1024))
            .with_state(git_state)
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            repository = %self.gateway.resolve_repository_root().display(),
            url = %format!("/{}", self.url_name),
            "serving workflow library repository"
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
