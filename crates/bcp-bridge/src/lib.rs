// bcp-bridge: the Backbox Control Protocol endpoint a pinball machine
// controller embeds to talk to its media controllers.
//
// The bridge owns the TCP transport: it dials each configured peer, runs
// the hello/goodbye lifecycle, fans host events out as wire commands, and
// dispatches inbound commands onto the host through the [`host::MachineHost`]
// contract. Wire mechanics live in the `bcp-protocol` crate.
//
// Layering, leaf to root: session (one socket each) -> router (all policy
// and state, one task) -> [`Bcp`] facade (what the host holds).

pub mod bridge;
pub mod config;
pub mod host;
pub mod router;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bridge::Bcp;
pub use config::{BcpConfig, ConfigError, ConnectionConfig, EventMapEntry, VarFilter};
pub use host::{
    EventHandler, FrameSink, HandlerId, LedCoordinate, MachineHost, MachineVarChange,
    MachineVarMonitor, ModeStartHook, ModeStopHook, PlayerVarChange, PlayerVarMonitor,
};
pub use router::RouterMsg;
pub use session::{CloseReason, PeerSession, SessionHandle, TransportError};
