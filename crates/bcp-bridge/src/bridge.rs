//! The host-facing facade.
//!
//! [`Bcp`] is the only object the machine controller holds. Construction
//! wires every host hook and spawns the router task; afterwards the facade
//! is a thin channel front: `send` fans a command out to every peer,
//! `shutdown` tears the transport down, and the registration entry points
//! feed the router's policy state.
//!
//! A machine with no `[bcp]` connections gets an unconfigured facade whose
//! operations are all no-ops.

use crate::config::BcpConfig;
use crate::host::{FrameSink, MachineHost};
use crate::router::{Router, RouterMsg};
use bcp_protocol::{ParamMap, encode_command_string};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::info;

pub struct Bcp {
    inner: Option<BcpInner>,
}

struct BcpInner {
    tx: mpsc::UnboundedSender<RouterMsg>,
    active_connections: Arc<AtomicUsize>,
}

impl Bcp {
    /// Build the bridge and spawn its router task. Must be called from
    /// within a tokio runtime. Pass `None` (no `[bcp]` connections in the
    /// machine config) for a quietly disabled bridge.
    ///
    /// Sessions are not opened here; they open when the host posts
    /// `init_phase_2`.
    pub fn new(config: Option<BcpConfig>, host: Arc<dyn MachineHost>) -> Bcp {
        let Some(config) = config else {
            info!("no bcp connections configured, bridge disabled");
            return Bcp { inner: None };
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let active_connections = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new(config, host, tx.clone(), Arc::clone(&active_connections));
        router.install();
        tokio::spawn(router.run(rx));

        Bcp {
            inner: Some(BcpInner {
                tx,
                active_connections,
            }),
        }
    }

    pub fn configured(&self) -> bool {
        self.inner.is_some()
    }

    /// Sessions currently holding an open socket.
    pub fn active_connections(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.active_connections.load(Ordering::SeqCst))
    }

    /// Encode a command and fan it out to every connected peer.
    pub fn send(&self, command: &str, params: ParamMap) {
        self.route(RouterMsg::Outbound {
            line: encode_command_string(command, &params),
        });
    }

    /// Stop every session (each says `goodbye` unless its peer already did)
    /// and detach all host-bus subscriptions.
    pub fn shutdown(&self) {
        self.route(RouterMsg::Shutdown);
    }

    /// Subscribe a host event for re-emission as an outbound `trigger`.
    /// Reference counted; pairs with [`Bcp::remove_registered_trigger_event`].
    pub fn add_registered_trigger_event(&self, event: &str) {
        self.route(RouterMsg::AddTrigger {
            event: event.to_owned(),
        });
    }

    pub fn remove_registered_trigger_event(&self, event: &str) {
        self.route(RouterMsg::RemoveTrigger {
            event: event.to_owned(),
        });
    }

    /// Register the physical DMD frame sink; tells peers to start streaming
    /// with `dmd_start?fps=<max_fps>`.
    pub fn register_dmd(&self, sink: FrameSink) {
        self.route(RouterMsg::RegisterDmd { sink, rgb: false });
    }

    pub fn register_rgb_dmd(&self, sink: FrameSink) {
        self.route(RouterMsg::RegisterDmd { sink, rgb: true });
    }

    fn route(&self, msg: RouterMsg) {
        if let Some(inner) = &self.inner {
            let _ = inner.tx.send(msg);
        }
    }
}
