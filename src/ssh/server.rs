//! The [`russh::server::Server`] implementation: one handler per inbound
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::server;
use tracing::info;

use super::session::SshSession;
use crate::auth::PublicKeyAuthenticator;
use crate::command::CommandDispatcher;

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    dispatcher: Arc<CommandDispatcher>,
    authenticator: Arc<dyn PublicKeyAuthenticator>,
}

impl SshServer {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        authenticator: Arc<dyn PublicKeyAuthenticator>,
    ) -> Self {
        Self {
            dispatcher,
            authenticator,
        }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.authenticator),
            peer_addr,
        )
    }
}
