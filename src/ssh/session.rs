//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].
//! The handler performs public-key authentication through the configured
//! authenticator, captures the client's `GIT_PROTOCOL` env request, and on
//! `exec` hands the channel over to the command dispatcher: channel data
//! becomes the invocation's input/output streams, stderr rides the
//! extended-data channel, and the exit sink drives the RFC 4254
//! exit-status / EOF / close sequence.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{fingerprint_of, PublicKeyAuthenticator, SessionIdentity};
use crate::command::{CommandDispatcher, ExitSink, GitCommand, Invocation, EXIT_FAILURE};
use crate::service::SessionStreams;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    dispatcher: Arc<CommandDispatcher>,
    authenticator: Arc<dyn PublicKeyAuthenticator>,
    peer_addr: Option<SocketAddr>,
    /// Set once public-key auth succeeds; immutable afterwards.
    identity: Option<SessionIdentity>,
    /// The session channel, captured at open so `exec` can consume it as a
    /// byte stream.
    channel: Option<Channel<Msg>>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
}

impl SshSession {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        authenticator: Arc<dyn PublicKeyAuthenticator>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            dispatcher,
            authenticator,
            peer_addr,
            identity: None,
            channel: None,
            git_protocol: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel close helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all
/// three signals; omitting exit-status or EOF causes the client to treat
/// the channel close as a transport failure ("the remote end hung up
/// unexpectedly").
async fn finish_channel(handle: &Handle, channel_id: ChannelId, exit_status: u32) {
    let _ = handle.exit_status_request(channel_id, exit_status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

/// Spawn the task that waits for the invocation's exit code and finishes
/// the channel with it.  The sink is set-once, so exactly one code ever
/// arrives; a dropped sink counts as failure.
fn spawn_exit_finisher(handle: Handle, channel_id: ChannelId) -> ExitSink {
    let (exit, exit_rx) = ExitSink::new();
    tokio::spawn(async move {
        let code = exit_rx.await.unwrap_or(EXIT_FAILURE);
        finish_channel(&handle, channel_id, code).await;
    });
    exit
}

// ---------------------------------------------------------------------------
// Extended-data writer
// ---------------------------------------------------------------------------

/// `AsyncWrite` adapter that forwards everything to the channel's
/// extended-data stream (type 1, stderr).  Writes are queued to a pump task
/// because the russh [`Handle`] methods are async.
struct ExtendedDataWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ExtendedDataWriter {
    fn new(handle: Handle, channel_id: ChannelId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if handle
                    .extended_data(channel_id, 1, CryptoVec::from_slice(&buf))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Self { tx }
    }
}

impl AsyncWrite for ExtendedDataWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Authenticate a client by public key.  The authenticator maps the key
    /// fingerprint to a session identity; an unknown key is rejected.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fp,
            "SSH public-key auth attempt"
        );

        match self.authenticator.authenticate(user, key) {
            Some(identity) => {
                info!(fingerprint = %fp, username = %identity.username, "SSH key resolved");
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            None => {
                warn!(fingerprint = %fp, "SSH key not registered");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// Keep the channel object so `exec_request` can turn it into the
    /// invocation's byte streams.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channel = Some(channel);
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here to
    /// negotiate protocol v2.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    /// Handle the `exec` request: parse the command line, assemble the
    /// invocation context, and run the command lifecycle on its own task so
    /// the session event loop stays responsive.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        info!(
            peer = ?self.peer_addr,
            user = self.identity.as_ref().map(|i| i.username.as_str()),
            command = %raw,
            "SSH exec request"
        );

        let handle = session.handle();

        // Auth and channel-open precede exec; a session that skipped either
        // gets a plain failure status.
        let (Some(identity), Some(channel)) = (self.identity.clone(), self.channel.take()) else {
            warn!(peer = ?self.peer_addr, "exec request without identity or session channel");
            finish_channel(&handle, channel_id, EXIT_FAILURE).await;
            return Ok(());
        };

        let command = GitCommand::parse(&raw);

        let (input, output) = tokio::io::split(channel.into_stream());
        let streams = SessionStreams {
            input: Box::new(input),
            output: Box::new(output),
            error: Box::new(ExtendedDataWriter::new(handle.clone(), channel_id)),
        };

        let invocation = Invocation {
            identity,
            streams,
            exit: spawn_exit_finisher(handle, channel_id),
            git_protocol: self.git_protocol.clone(),
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            dispatcher.run(command, invocation).await;
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
