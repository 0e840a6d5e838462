//! A scripted media controller on a real TCP socket.
//!
//! `MockPeer` listens on a random loopback port; each accepted connection
//! becomes a [`PeerConn`] that speaks framed BCP both ways. Every receive
//! is guarded by a five second timeout so a wedged bridge fails the test
//! instead of hanging it.

use bcp_protocol::{BcpFramer, ParamMap, RawFrame, decode_command_string};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockPeer {
    listener: TcpListener,
}

impl MockPeer {
    /// Bind on a random loopback port.
    pub async fn bind() -> MockPeer {
        MockPeer::bind_on(0).await
    }

    /// Bind on a specific loopback port, for tests that dial first and
    /// bring the peer up afterwards.
    pub async fn bind_on(port: u16) -> MockPeer {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind mock peer");
        MockPeer { listener }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local_addr after bind")
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Wait for the bridge to dial in.
    pub async fn accept(&self) -> PeerConn {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("bridge did not connect in time")
            .expect("accept");
        PeerConn {
            framed: Framed::new(stream, BcpFramer),
        }
    }
}

pub struct PeerConn {
    framed: Framed<TcpStream, BcpFramer>,
}

impl PeerConn {
    /// Receive the next frame, panicking on timeout, error, or EOF.
    pub async fn recv_frame(&mut self) -> RawFrame {
        timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("no frame within timeout")
            .expect("connection closed while expecting a frame")
            .expect("frame error")
    }

    /// Receive and decode the next command.
    pub async fn recv_command(&mut self) -> (String, ParamMap) {
        let frame = self.recv_frame().await;
        decode_command_string(&frame.line).expect("undecodable command")
    }

    /// Receive commands until one matches `command`, returning its params.
    /// Anything skipped is simply dropped, like a controller that does not
    /// care about those messages.
    pub async fn recv_until(&mut self, command: &str) -> ParamMap {
        loop {
            let (cmd, params) = self.recv_command().await;
            if cmd == command {
                return params;
            }
        }
    }

    /// True when the bridge closed the connection.
    pub async fn recv_eof(&mut self) -> bool {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => panic!("no EOF within timeout"),
        }
    }

    /// Send one wire line (terminator added by the framer).
    pub async fn send_line(&mut self, line: &str) {
        self.framed
            .send(line.to_owned())
            .await
            .expect("send to bridge");
    }

    /// Send raw bytes, for header + binary payload sequences.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write to bridge");
        stream.flush().await.expect("flush to bridge");
    }

    /// Drop our end of the socket.
    pub fn close(self) {}
}
