//! `russh` implementation of the transport traits.
//!
//! # Connections
//!
//! - Fresh: `client::connect` to `address:port` under the endpoint timeout
//! - Tunneled: a `direct-tcpip` channel on the parent session, wrapped with
//!   `into_stream()` and handed to `client::connect_stream`, so the SSH
//!   handshake of the next hop runs inside the previous hop's session
//!
//! Both paths authenticate with the [`AuthChain`] derived from the
//! endpoint's credential.
//!
//! # Shells
//!
//! A PTY channel is split into halves. A background reader task forwards
//! output into an unbounded channel until the remote closes or the shell is
//! dropped (cancellation token), which gives [`ShellStream::try_recv`] its
//! non-blocking semantics. Input goes straight through the write half.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::ChainClientHandler;
use super::{Endpoint, ExecOutput, RemoteSession, ShellStream, Transport, TransportError};
use crate::chain::auth::{AuthChain, AuthStrategy};

/// Keepalive interval for every session in a chain
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered keepalives before the session is considered dead
const KEEPALIVE_MAX: usize = 3;

/// PTY geometry. Wide enough that prompts and echoed commands do not wrap.
const PTY_COLUMNS: u32 = 512;
const PTY_ROWS: u32 = 48;

/// Build the russh client configuration shared by all hops.
///
/// No inactivity timeout: a bastion is legitimately idle at the SSH layer
/// while the hop behind it waits on a prompt. Dead peers are detected by
/// keepalives instead.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    })
}

/// Opens fresh connections over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshTransport;

impl RusshTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>, TransportError> {
        info!(
            "Connecting to {}@{}:{}",
            endpoint.username, endpoint.address, endpoint.port
        );

        let handler = ChainClientHandler::new(&endpoint.host_name);
        let connect_future = client::connect(
            build_client_config(),
            (endpoint.address.as_str(), endpoint.port),
            handler,
        );

        let handle = tokio::time::timeout(endpoint.timeout, connect_future)
            .await
            .map_err(|_| TransportError::Timeout(endpoint.timeout))?
            .map_err(|e| TransportError::Connect(format!("Failed to connect: {}", e)))?;

        let session = RusshSession::authenticate(handle, endpoint).await?;
        Ok(Arc::new(session))
    }
}

/// An authenticated russh session.
pub struct RusshSession {
    host_name: String,
    handle: client::Handle<ChainClientHandler>,
}

impl RusshSession {
    async fn authenticate(
        mut handle: client::Handle<ChainClientHandler>,
        endpoint: &Endpoint,
    ) -> Result<Self, TransportError> {
        let auth_chain = AuthChain::for_credential(&endpoint.credential);

        let accepted = tokio::time::timeout(
            endpoint.timeout,
            auth_chain.authenticate(&mut handle, &endpoint.username),
        )
        .await
        .map_err(|_| TransportError::Timeout(endpoint.timeout))??;

        if !accepted {
            return Err(TransportError::Auth(
                "Authentication failed: no authentication methods succeeded".to_string(),
            ));
        }

        Ok(Self {
            host_name: endpoint.host_name.clone(),
            handle,
        })
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn connect_through(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        info!(
            "Tunneling to {}@{}:{} through {}",
            endpoint.username, endpoint.address, endpoint.port, self.host_name
        );

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                endpoint.address.as_str(),
                u32::from(endpoint.port),
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| {
                TransportError::Connect(format!(
                    "Failed to open tunnel through {}: {}",
                    self.host_name, e
                ))
            })?;

        let handler = ChainClientHandler::new(&endpoint.host_name);
        let connect_future =
            client::connect_stream(build_client_config(), channel.into_stream(), handler);

        let handle = tokio::time::timeout(endpoint.timeout, connect_future)
            .await
            .map_err(|_| TransportError::Timeout(endpoint.timeout))?
            .map_err(|e| {
                TransportError::Connect(format!("Failed to connect through tunnel: {}", e))
            })?;

        let session = RusshSession::authenticate(handle, endpoint).await?;
        Ok(Arc::new(session))
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to execute command: {}", e)))?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_status: Option<u32> = None;

        let collected = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    // ext == 1 is stderr in SSH protocol
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = Some(status)
                    }
                    Some(ChannelMsg::Eof) if exit_status.is_some() => break,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let timed_out = collected.is_err();
        if timed_out {
            warn!(
                "Command on {} timed out after {:?} ({} bytes stdout, {} bytes stderr)",
                self.host_name,
                timeout,
                stdout.len(),
                stderr.len()
            );
        }

        let _ = channel.close().await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
            timed_out,
        })
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellStream>, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(false, "xterm", PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to start shell: {}", e)))?;

        debug!("PTY shell opened on {}", self.host_name);

        let (mut read_half, write_half) = channel.split();
        let (tx, inbox) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let reader_token = cancel_token.clone();
        let host_name = self.host_name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    msg = read_half.wait() => match msg {
                        Some(ChannelMsg::Data { data })
                        | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if tx.send(data.to_vec()).is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            debug!("Shell reader on {} stopped", host_name);
        });

        Ok(Box::new(RusshShell {
            writer: write_half,
            inbox,
            cancel_token,
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        debug!("Disconnecting from {}", self.host_name);
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to disconnect: {}", e)))
    }
}

/// PTY shell over a split russh channel.
pub struct RusshShell {
    writer: ChannelWriteHalf<client::Msg>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel_token: CancellationToken,
}

#[async_trait]
impl ShellStream for RusshShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writer
            .data(data)
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to write to shell: {}", e)))
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.inbox.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.cancel_token.cancel();
        self.writer
            .close()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to close shell channel: {}", e)))
    }
}

impl Drop for RusshShell {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod client_config {
        use super::*;

        #[test]
        fn test_keepalive_configured() {
            let config = build_client_config();
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_no_inactivity_timeout() {
            assert_eq!(build_client_config().inactivity_timeout, None);
        }
    }

    mod connect {
        use super::*;
        use crate::chain::types::Credential;

        #[tokio::test]
        async fn test_connect_refused_is_error() {
            // Port 1 on localhost is essentially never listening
            let endpoint = Endpoint {
                host_name: "nowhere".into(),
                address: "127.0.0.1".into(),
                port: 1,
                username: "nobody".into(),
                credential: Credential::Password("x".into()),
                timeout: Duration::from_secs(2),
            };
            let result = RusshTransport::new().connect(&endpoint).await;
            assert!(result.is_err());
        }
    }
}
