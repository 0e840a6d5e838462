//! Peer TCP session.
//!
//! Each configured connection gets one [`PeerSession`] task that owns the
//! socket end-to-end: it dials the media controller (with bounded backoff),
//! opens the conversation with a local `hello`, then pumps frames both ways
//! until told to stop or the peer goes away. Decoded inbound commands are
//! handed to the router; `hello` and `goodbye` are handled locally.

use crate::config::ConnectionConfig;
use crate::router::RouterMsg;
use bcp_protocol::{BCP_VERSION, BcpFramer, CodecError, ParamMap, decode_command_string, encode_command_string};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Terminal session errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {peer} timed out after {timeout:?}")]
    ConnectTimeout { peer: String, timeout: Duration },
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent `goodbye`.
    Goodbye,
    /// Broken pipe, reset, EOF, or connect-deadline exhaustion.
    Transport,
    /// We were told to stop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Open,
    Closing,
}

/// The router's grip on a running session: a name, the outbound line queue,
/// and the stop signal. Dropping the handle stops the session.
pub struct SessionHandle {
    name: String,
    required: bool,
    outbound: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn required(&self) -> bool {
        self.required
    }

    /// Queue one wire line for delivery. Lines are written in submission
    /// order; sends to a closing session are silently dropped.
    pub fn send(&self, line: String) {
        let _ = self.outbound.send(line);
    }

    /// Ask the session to close. It says `goodbye` first unless the peer
    /// already said it.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    #[cfg(test)]
    pub(crate) fn detached(
        name: &str,
        required: bool,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let handle = SessionHandle {
            name: name.to_owned(),
            required,
            outbound,
            stop,
        };
        (handle, outbound_rx)
    }
}

/// One peer connection, run as its own task.
pub struct PeerSession {
    config: ConnectionConfig,
    router_tx: mpsc::UnboundedSender<RouterMsg>,
    active_connections: Arc<AtomicUsize>,
}

impl PeerSession {
    /// Spawn the session task and return the router's handle to it.
    pub fn spawn(
        config: ConnectionConfig,
        router_tx: mpsc::UnboundedSender<RouterMsg>,
        active_connections: Arc<AtomicUsize>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = SessionHandle {
            name: config.name.clone(),
            required: config.required,
            outbound: outbound_tx,
            stop: stop_tx,
        };
        let session = PeerSession {
            config,
            router_tx,
            active_connections,
        };
        tokio::spawn(session.run(outbound_rx, stop_rx));
        handle
    }

    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let name = self.config.name.clone();
        debug!(session = %name, state = ?SessionState::Connecting, "session starting");

        let stream = tokio::select! {
            biased;
            // The stop signal only ever transitions by send(true) or by the
            // handle being dropped; either way this session is done.
            _ = stop.changed() => {
                let _ = self.router_tx.send(RouterMsg::SessionClosed {
                    session: name,
                    reason: CloseReason::Shutdown,
                });
                return;
            }
            connected = self.connect_with_backoff() => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(session = %name, error = %e, "peer connect failed");
                    let _ = self.router_tx.send(RouterMsg::SessionClosed {
                        session: name,
                        reason: CloseReason::Transport,
                    });
                    return;
                }
            }
        };

        self.active_connections.fetch_add(1, Ordering::SeqCst);
        let mut framed = Framed::new(stream, BcpFramer);
        let mut send_goodbye = true;

        // The opener speaks first.
        let reason = if framed.send(hello_line()).await.is_err() {
            CloseReason::Transport
        } else {
            debug!(session = %name, state = ?SessionState::Open, "handshake sent");
            let _ = self.router_tx.send(RouterMsg::SessionConnected {
                session: name.clone(),
            });
            self.pump(&name, &mut framed, &mut outbound, &mut stop, &mut send_goodbye)
                .await
        };

        debug!(session = %name, state = ?SessionState::Closing, ?reason, "closing");
        if reason == CloseReason::Shutdown {
            // Flush what was already queued, then say goodbye unless the
            // peer said it first.
            while let Ok(line) = outbound.try_recv() {
                let _ = framed.send(line).await;
            }
            if send_goodbye {
                let _ = framed.send("goodbye".to_owned()).await;
            }
        }
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        let _ = self
            .router_tx
            .send(RouterMsg::SessionClosed { session: name, reason });
    }

    /// The open-state loop: relay outbound lines, surface inbound commands.
    async fn pump(
        &self,
        name: &str,
        framed: &mut Framed<TcpStream, BcpFramer>,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        stop: &mut watch::Receiver<bool>,
        send_goodbye: &mut bool,
    ) -> CloseReason {
        loop {
            tokio::select! {
                biased;
                // Completes on send(true) or on handle drop; both mean stop.
                _ = stop.changed() => return CloseReason::Shutdown,
                line = outbound.recv() => match line {
                    Some(line) => {
                        debug!(session = %name, %line, "send");
                        if framed.send(line).await.is_err() {
                            return CloseReason::Transport;
                        }
                    }
                    // The router dropped us; close out gracefully.
                    None => return CloseReason::Shutdown,
                },
                frame = framed.next() => match frame {
                    None => {
                        info!(session = %name, "peer closed the connection");
                        return CloseReason::Transport;
                    }
                    Some(Err(CodecError::Io(e))) => {
                        warn!(session = %name, error = %e, "socket error");
                        return CloseReason::Transport;
                    }
                    Some(Err(e)) => {
                        warn!(session = %name, error = %e, "dropping unframeable message");
                    }
                    Some(Ok(frame)) => match decode_command_string(&frame.line) {
                        Err(e) => {
                            warn!(session = %name, error = %e, "dropping undecodable message");
                        }
                        Ok((command, params)) => match command.as_str() {
                            "hello" => {
                                debug!(session = %name, ?params, "peer hello");
                            }
                            "goodbye" => {
                                *send_goodbye = false;
                                return CloseReason::Goodbye;
                            }
                            _ => {
                                let _ = self.router_tx.send(RouterMsg::Inbound {
                                    session: name.to_owned(),
                                    command,
                                    params,
                                    payload: frame.payload,
                                });
                            }
                        },
                    },
                }
            }
        }
    }

    /// Dial the peer, retrying with bounded exponential backoff until the
    /// configured deadline.
    async fn connect_with_backoff(&self) -> Result<TcpStream, TransportError> {
        let peer = format!("{}:{}", self.config.host, self.config.port);
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut delay = Duration::from_millis(250);
        info!(session = %self.config.name, %peer, "connecting to media controller");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ConnectTimeout {
                    peer,
                    timeout: self.config.connect_timeout,
                });
            }
            match timeout(
                remaining,
                TcpStream::connect((self.config.host.as_str(), self.config.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    info!(session = %self.config.name, %peer, "connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(session = %self.config.name, error = %e, "connect attempt failed, retrying");
                }
                Err(_) => continue,
            }
            let pause = delay.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }
}

fn hello_line() -> String {
    let mut params = ParamMap::new();
    params.insert("version".to_owned(), BCP_VERSION.into());
    params.insert("controller_name".to_owned(), env!("CARGO_PKG_NAME").into());
    params.insert(
        "controller_version".to_owned(),
        env!("CARGO_PKG_VERSION").into(),
    );
    encode_command_string("hello", &params)
}
