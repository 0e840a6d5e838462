//! The contract between the bridge and the machine controller that embeds
//! it.
//!
//! Everything the bridge needs from the host (event bus, switch controller,
//! show queue, game state, hardware platform, lifecycle) is reached through
//! [`MachineHost`]. Handlers are plain function values; the bridge never
//! holds the host's internals, and the host never sees bridge internals
//! beyond the facade.

use bcp_protocol::{ParamMap, Value};
use std::sync::Arc;

/// Token returned by [`MachineHost::add_handler`], used to detach exactly
/// the handler that was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// An event-bus subscriber: receives the event name and its kwargs.
pub type EventHandler = Arc<dyn Fn(&str, &ParamMap) + Send + Sync>;

/// Receives raw display frame bytes and forwards them to hardware.
pub type FrameSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called by the host when a mode starts; returns the hook the host must
/// call when that mode stops.
pub type ModeStartHook = Box<dyn Fn(&str, i64) -> ModeStopHook + Send + Sync>;

/// Called by the host when a previously started mode stops.
pub type ModeStopHook = Box<dyn FnOnce() + Send>;

/// One player-variable mutation as reported by the host's player monitor.
#[derive(Debug, Clone)]
pub struct PlayerVarChange {
    pub name: String,
    pub value: Value,
    pub prev_value: Value,
    pub change: Value,
    pub player_num: i64,
}

/// One machine-variable mutation as reported by the host's monitor.
#[derive(Debug, Clone)]
pub struct MachineVarChange {
    pub name: String,
    pub value: Value,
    pub prev_value: Value,
    pub change: Value,
}

pub type PlayerVarMonitor = Arc<dyn Fn(PlayerVarChange) + Send + Sync>;
pub type MachineVarMonitor = Arc<dyn Fn(MachineVarChange) + Send + Sync>;

/// An LED with a configured playfield position. Only LEDs with both
/// coordinates set are reported to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct LedCoordinate {
    pub name: String,
    pub x: f64,
    pub y: f64,
}

/// Host-side services consumed by the bridge.
///
/// The show-queue methods are the one boundary that must be safe to call
/// from outside the host's main loop; everything else is invoked either
/// from the router task or synchronously from host callbacks.
pub trait MachineHost: Send + Sync {
    // --- Event bus -------------------------------------------------------

    fn add_handler(&self, event: &str, handler: EventHandler) -> HandlerId;
    fn remove_handler(&self, event: &str, id: HandlerId);
    fn post_event(&self, event: &str, params: ParamMap);

    // --- Variable monitors ----------------------------------------------

    fn enable_player_monitor(&self, monitor: PlayerVarMonitor);
    fn enable_machine_var_monitor(&self, monitor: MachineVarMonitor);

    // --- Mode controller -------------------------------------------------

    fn register_mode_start(&self, hook: ModeStartHook);

    // --- Switch controller -----------------------------------------------

    fn has_switch(&self, name: &str) -> bool;
    fn switch_active(&self, name: &str) -> bool;
    fn process_switch(&self, name: &str, state: i64, logical: bool);

    // --- Show controller queue (thread-safe) -----------------------------

    fn enqueue_show_start(&self, name: &str, params: ParamMap);
    fn enqueue_show_stop(&self, name: &str);
    fn enqueue_show_frame(&self, name: &str, params: ParamMap);

    // --- Game state ------------------------------------------------------

    fn game_active(&self) -> bool;
    fn is_player_var(&self, name: &str) -> bool;
    fn player_vars(&self) -> Vec<(String, Value)>;
    fn machine_vars(&self) -> Vec<(String, Value)>;
    fn led_coordinates(&self) -> Vec<LedCoordinate>;

    // --- Hardware platform -----------------------------------------------

    fn has_dmd(&self) -> bool;
    fn has_rgb_dmd(&self) -> bool;
    /// Ask the platform to set up its DMD pipeline; the platform answers by
    /// calling the facade's `register_dmd` with a frame sink.
    fn configure_dmd(&self);
    fn configure_rgb_dmd(&self);

    // --- Clock / lifecycle -----------------------------------------------

    fn max_fps(&self) -> u32;
    /// A peer reported that its reset sequence finished.
    fn reset_complete(&self);
    /// The bridge hit a terminal condition (peer goodbye, transport loss of
    /// a required peer). The host should stop the machine.
    fn request_stop(&self);
}
