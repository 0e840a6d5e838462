//! A scripted [`MachineHost`] double.
//!
//! Records every call the bridge makes (posted events, processed switches,
//! show-queue traffic, stop requests) and lets tests drive the host side:
//! posting bus events into registered handlers, firing variable monitors,
//! and starting modes through the registered mode-start hook.
//!
//! Compiled for this crate's own tests and, behind the `test-support`
//! feature, for downstream test crates.

use crate::host::{
    EventHandler, HandlerId, LedCoordinate, MachineHost, MachineVarChange, MachineVarMonitor,
    ModeStartHook, ModeStopHook, PlayerVarChange, PlayerVarMonitor,
};
use bcp_protocol::{ParamMap, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One show-queue entry as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ShowCommand {
    Start { name: String, params: ParamMap },
    Stop { name: String },
    Frame { name: String, params: ParamMap },
}

#[derive(Default)]
struct State {
    next_handler_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    posted: Vec<(String, ParamMap)>,
    switches: HashMap<String, bool>,
    processed_switches: Vec<(String, i64, bool)>,
    show_commands: Vec<ShowCommand>,
    player_monitor: Option<PlayerVarMonitor>,
    machine_monitor: Option<MachineVarMonitor>,
    mode_start: Option<ModeStartHook>,
    game_active: bool,
    player_vars: Vec<(String, Value)>,
    machine_vars: Vec<(String, Value)>,
    leds: Vec<LedCoordinate>,
    has_dmd: bool,
    has_rgb_dmd: bool,
    configure_dmd_calls: usize,
    configure_rgb_dmd_calls: usize,
    max_fps: u32,
    reset_complete_calls: usize,
    stop_requested: bool,
}

#[derive(Default)]
pub struct MockHost {
    state: Mutex<State>,
}

impl MockHost {
    pub fn new() -> Arc<MockHost> {
        let host = MockHost::default();
        host.state.lock().unwrap().max_fps = 30;
        Arc::new(host)
    }

    // --- Scripting -------------------------------------------------------

    pub fn add_switch(&self, name: &str, active: bool) {
        self.state
            .lock()
            .unwrap()
            .switches
            .insert(name.to_owned(), active);
    }

    pub fn set_game_active(&self, active: bool) {
        self.state.lock().unwrap().game_active = active;
    }

    pub fn set_player_var(&self, name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.player_vars.retain(|(n, _)| n != name);
        state.player_vars.push((name.to_owned(), value));
    }

    pub fn set_machine_var(&self, name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.machine_vars.retain(|(n, _)| n != name);
        state.machine_vars.push((name.to_owned(), value));
    }

    pub fn set_leds(&self, leds: Vec<LedCoordinate>) {
        self.state.lock().unwrap().leds = leds;
    }

    pub fn enable_dmd(&self) {
        self.state.lock().unwrap().has_dmd = true;
    }

    pub fn enable_rgb_dmd(&self) {
        self.state.lock().unwrap().has_rgb_dmd = true;
    }

    pub fn set_max_fps(&self, fps: u32) {
        self.state.lock().unwrap().max_fps = fps;
    }

    // --- Driving the host side ------------------------------------------

    /// Post a bus event into every handler registered for it, recording it
    /// like any other post.
    pub fn post(&self, event: &str, params: ParamMap) {
        let handlers: Vec<EventHandler> = {
            let mut state = self.state.lock().unwrap();
            state.posted.push((event.to_owned(), params.clone()));
            state
                .handlers
                .get(event)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event, &params);
        }
    }

    pub fn fire_player_var(&self, change: PlayerVarChange) {
        let monitor = self.state.lock().unwrap().player_monitor.clone();
        if let Some(monitor) = monitor {
            monitor(change);
        }
    }

    pub fn fire_machine_var(&self, change: MachineVarChange) {
        let monitor = self.state.lock().unwrap().machine_monitor.clone();
        if let Some(monitor) = monitor {
            monitor(change);
        }
    }

    /// Start a mode through the registered hook, returning the stop hook.
    pub fn start_mode(&self, name: &str, priority: i64) -> Option<ModeStopHook> {
        let state = self.state.lock().unwrap();
        state.mode_start.as_ref().map(|hook| hook(name, priority))
    }

    // --- Observation -----------------------------------------------------

    pub fn posted(&self) -> Vec<(String, ParamMap)> {
        self.state.lock().unwrap().posted.clone()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn total_handler_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .handlers
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn processed_switches(&self) -> Vec<(String, i64, bool)> {
        self.state.lock().unwrap().processed_switches.clone()
    }

    pub fn show_commands(&self) -> Vec<ShowCommand> {
        self.state.lock().unwrap().show_commands.clone()
    }

    pub fn configure_dmd_calls(&self) -> usize {
        self.state.lock().unwrap().configure_dmd_calls
    }

    pub fn configure_rgb_dmd_calls(&self) -> usize {
        self.state.lock().unwrap().configure_rgb_dmd_calls
    }

    pub fn reset_complete_calls(&self) -> usize {
        self.state.lock().unwrap().reset_complete_calls
    }

    pub fn stop_requested(&self) -> bool {
        self.state.lock().unwrap().stop_requested
    }
}

impl MachineHost for MockHost {
    fn add_handler(&self, event: &str, handler: EventHandler) -> HandlerId {
        let mut state = self.state.lock().unwrap();
        state.next_handler_id += 1;
        let id = HandlerId(state.next_handler_id);
        state
            .handlers
            .entry(event.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove_handler(&self, event: &str, id: HandlerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.handlers.get_mut(event) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                state.handlers.remove(event);
            }
        }
    }

    fn post_event(&self, event: &str, params: ParamMap) {
        self.post(event, params);
    }

    fn enable_player_monitor(&self, monitor: PlayerVarMonitor) {
        self.state.lock().unwrap().player_monitor = Some(monitor);
    }

    fn enable_machine_var_monitor(&self, monitor: MachineVarMonitor) {
        self.state.lock().unwrap().machine_monitor = Some(monitor);
    }

    fn register_mode_start(&self, hook: ModeStartHook) {
        self.state.lock().unwrap().mode_start = Some(hook);
    }

    fn has_switch(&self, name: &str) -> bool {
        self.state.lock().unwrap().switches.contains_key(name)
    }

    fn switch_active(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .switches
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    fn process_switch(&self, name: &str, state: i64, logical: bool) {
        self.state
            .lock()
            .unwrap()
            .processed_switches
            .push((name.to_owned(), state, logical));
    }

    fn enqueue_show_start(&self, name: &str, params: ParamMap) {
        self.state.lock().unwrap().show_commands.push(ShowCommand::Start {
            name: name.to_owned(),
            params,
        });
    }

    fn enqueue_show_stop(&self, name: &str) {
        self.state.lock().unwrap().show_commands.push(ShowCommand::Stop {
            name: name.to_owned(),
        });
    }

    fn enqueue_show_frame(&self, name: &str, params: ParamMap) {
        self.state.lock().unwrap().show_commands.push(ShowCommand::Frame {
            name: name.to_owned(),
            params,
        });
    }

    fn game_active(&self) -> bool {
        self.state.lock().unwrap().game_active
    }

    fn is_player_var(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .player_vars
            .iter()
            .any(|(n, _)| n == name)
    }

    fn player_vars(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().player_vars.clone()
    }

    fn machine_vars(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().machine_vars.clone()
    }

    fn led_coordinates(&self) -> Vec<LedCoordinate> {
        self.state.lock().unwrap().leds.clone()
    }

    fn has_dmd(&self) -> bool {
        self.state.lock().unwrap().has_dmd
    }

    fn has_rgb_dmd(&self) -> bool {
        self.state.lock().unwrap().has_rgb_dmd
    }

    fn configure_dmd(&self) {
        self.state.lock().unwrap().configure_dmd_calls += 1;
    }

    fn configure_rgb_dmd(&self) {
        self.state.lock().unwrap().configure_rgb_dmd_calls += 1;
    }

    fn max_fps(&self) -> u32 {
        self.state.lock().unwrap().max_fps
    }

    fn reset_complete(&self) {
        self.state.lock().unwrap().reset_complete_calls += 1;
    }

    fn request_stop(&self) {
        self.state.lock().unwrap().stop_requested = true;
    }
}
