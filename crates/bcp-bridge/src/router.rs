//! The routing hub.
//!
//! The router task owns every piece of mutable bridge state: the set of
//! peer sessions, the trigger-subscription registry, the variable filters,
//! the DMD sinks, and the connection lifecycle. Everything else (sessions,
//! the facade, host-bus callbacks) talks to it through [`RouterMsg`] on an
//! unbounded channel, which serializes all mutation onto one task.

use crate::config::BcpConfig;
use crate::host::{
    FrameSink, HandlerId, MachineHost, MachineVarChange, PlayerVarChange,
};
use crate::session::{CloseReason, PeerSession, SessionHandle};
use bcp_protocol::{ParamMap, Value, encode_command_string};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs when the transport comes up (or immediately-ish, if it already is).
pub type ConnectionCallback = Box<dyn FnOnce() + Send>;

/// Everything the router can be asked to do.
pub enum RouterMsg {
    /// A session finished its handshake.
    SessionConnected { session: String },
    /// A session ended; `reason` decides whether the machine keeps running.
    SessionClosed { session: String, reason: CloseReason },
    /// A decoded peer command, with its binary payload if one was framed.
    Inbound {
        session: String,
        command: String,
        params: ParamMap,
        payload: Option<Bytes>,
    },
    /// A pre-encoded line to fan out to every session.
    Outbound { line: String },
    /// Open one session per configured connection (host `init_phase_2`).
    OpenConnections,
    /// Arrange DMD plumbing (host `init_phase_1`).
    SetupDmds,
    /// Stop all sessions and detach every host-bus subscription.
    Shutdown,
    AddTrigger { event: String },
    RemoveTrigger { event: String },
    /// A subscribed host event fired; re-emit it as an outbound `trigger`.
    Trigger { name: String, params: ParamMap },
    PlayerVar(PlayerVarChange),
    MachineVar(MachineVarChange),
    PlayerAdded { num: i64 },
    /// Host machine reset phase 1: tell peers to reset.
    Reset,
    /// Host asked for the LED coordinate export.
    LedCoordinates,
    /// A configured event-map entry fired.
    EventMapFire {
        command: String,
        template: Vec<(String, String)>,
        kwargs: ParamMap,
    },
    RegisterDmd { sink: FrameSink, rgb: bool },
    FlushConnectionCallbacks,
}

pub struct Router {
    host: Arc<dyn MachineHost>,
    config: BcpConfig,
    tx: mpsc::UnboundedSender<RouterMsg>,
    active_connections: Arc<AtomicUsize>,
    sessions: Vec<SessionHandle>,
    pending_connects: usize,
    connected: bool,
    shutting_down: bool,
    trigger_refcounts: CaseInsensitiveCounter,
    trigger_handlers: HashMap<String, HandlerId>,
    hook_handlers: Vec<(String, HandlerId)>,
    connection_callbacks: Vec<ConnectionCallback>,
    dmd_sink: Option<FrameSink>,
    rgb_dmd_sink: Option<FrameSink>,
}

impl Router {
    pub fn new(
        config: BcpConfig,
        host: Arc<dyn MachineHost>,
        tx: mpsc::UnboundedSender<RouterMsg>,
        active_connections: Arc<AtomicUsize>,
    ) -> Router {
        Router {
            host,
            config,
            tx,
            active_connections,
            sessions: Vec::new(),
            pending_connects: 0,
            connected: false,
            shutting_down: false,
            trigger_refcounts: CaseInsensitiveCounter::default(),
            trigger_handlers: HashMap::new(),
            hook_handlers: Vec::new(),
            connection_callbacks: Vec::new(),
            dmd_sink: None,
            rgb_dmd_sink: None,
        }
    }

    /// Wire every host-side hook: lifecycle events, variable monitors, the
    /// mode-start method, event-map entries, and the preseeded trigger
    /// registrations the media controller already handles.
    pub fn install(&mut self) {
        self.hook("init_phase_1", |_| Some(RouterMsg::SetupDmds));
        self.hook("init_phase_2", |_| Some(RouterMsg::OpenConnections));
        self.hook("player_add_success", |params| {
            params
                .get("num")
                .and_then(Value::as_i64)
                .map(|num| RouterMsg::PlayerAdded { num })
        });
        self.hook("machine_reset_phase_1", |_| Some(RouterMsg::Reset));
        self.hook("bcp_get_led_coordinates", |_| Some(RouterMsg::LedCoordinates));

        for entry in self.config.event_map.clone() {
            let command = entry.command;
            let template = entry.params;
            self.hook(&entry.event, move |kwargs| {
                Some(RouterMsg::EventMapFire {
                    command: command.clone(),
                    template: template.clone(),
                    kwargs: kwargs.clone(),
                })
            });
        }

        let tx = self.tx.clone();
        self.host.enable_player_monitor(Arc::new(move |change| {
            let _ = tx.send(RouterMsg::PlayerVar(change));
        }));
        let tx = self.tx.clone();
        self.host.enable_machine_var_monitor(Arc::new(move |change| {
            let _ = tx.send(RouterMsg::MachineVar(change));
        }));

        let tx = self.tx.clone();
        self.host.register_mode_start(Box::new(move |mode: &str, priority: i64| {
            let mut params = ParamMap::new();
            params.insert("name".to_owned(), mode.into());
            params.insert("priority".to_owned(), Value::Int(priority));
            let _ = tx.send(RouterMsg::Outbound {
                line: encode_command_string("mode_start", &params),
            });

            let tx = tx.clone();
            let mode = mode.to_owned();
            Box::new(move || {
                let mut params = ParamMap::new();
                params.insert("name".to_owned(), mode.into());
                let _ = tx.send(RouterMsg::Outbound {
                    line: encode_command_string("mode_stop", &params),
                });
            })
        }));

        // Events the media controller side already reacts to; registering
        // them here keeps a later peer `register_trigger` from attaching a
        // second handler.
        self.add_registered_trigger_event("ball_started");
        self.add_registered_trigger_event("ball_ended");
        self.add_registered_trigger_event("player_add_success");
        self.add_registered_trigger_event("player_score");
        let player_vars: Vec<String> = self
            .config
            .player_variables
            .whitelist()
            .map(|var| format!("player_{var}"))
            .collect();
        for event in player_vars {
            self.add_registered_trigger_event(&event);
        }
        let machine_vars: Vec<String> = self
            .config
            .machine_variables
            .whitelist()
            .map(|var| format!("machine_var_{var}"))
            .collect();
        for event in machine_vars {
            self.add_registered_trigger_event(&event);
        }
    }

    /// Process messages until shutdown completes.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RouterMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle_msg(msg);
            if self.shutting_down && self.sessions.is_empty() {
                break;
            }
        }
        debug!("router task finished");
    }

    pub(crate) fn handle_msg(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::SessionConnected { session } => self.session_connected(&session),
            RouterMsg::SessionClosed { session, reason } => self.session_closed(&session, reason),
            RouterMsg::Inbound {
                session,
                command,
                params,
                payload,
            } => self.handle_inbound(&session, &command, params, payload),
            RouterMsg::Outbound { line } => self.broadcast(line),
            RouterMsg::OpenConnections => self.open_connections(),
            RouterMsg::SetupDmds => self.setup_dmds(),
            RouterMsg::Shutdown => self.begin_shutdown(),
            RouterMsg::AddTrigger { event } => self.add_registered_trigger_event(&event),
            RouterMsg::RemoveTrigger { event } => self.remove_registered_trigger_event(&event),
            RouterMsg::Trigger { name, params } => self.handle_trigger(&name, params),
            RouterMsg::PlayerVar(change) => self.handle_player_var(change),
            RouterMsg::MachineVar(change) => self.handle_machine_var(change),
            RouterMsg::PlayerAdded { num } => {
                let mut params = ParamMap::new();
                params.insert("player_num".to_owned(), Value::Int(num));
                self.send_command("player_added", &params);
            }
            RouterMsg::Reset => self.send_command("reset", &ParamMap::new()),
            RouterMsg::LedCoordinates => self.send_led_coordinates(),
            RouterMsg::EventMapFire {
                command,
                template,
                kwargs,
            } => self.handle_event_map(&command, &template, &kwargs),
            RouterMsg::RegisterDmd { sink, rgb } => self.register_dmd(sink, rgb),
            RouterMsg::FlushConnectionCallbacks => self.flush_connection_callbacks(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    fn handle_inbound(
        &mut self,
        session: &str,
        command: &str,
        mut params: ParamMap,
        payload: Option<Bytes>,
    ) {
        debug!(session, command, "processing command");
        match command {
            "" => warn!(session, "empty command received"),
            "error" => warn!(session, ?params, "peer reported an error"),
            "switch" => self.receive_switch(session, &params),
            "trigger" => {
                let Some(name) = take_string(&mut params, "name") else {
                    // A nameless trigger carries nothing; drop it.
                    return;
                };
                let callback = take_string(&mut params, "callback");
                self.host.post_event(&name, params);
                if let Some(callback) = callback {
                    let mut reply = ParamMap::new();
                    reply.insert("name".to_owned(), callback.into());
                    self.send_command("trigger", &reply);
                }
            }
            "register_trigger" => match take_string(&mut params, "event") {
                Some(event) => self.add_registered_trigger_event(&event),
                None => warn!(session, "register_trigger without an event"),
            },
            "get" => match params.get("names").and_then(Value::as_str) {
                Some(names) => {
                    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                        self.host.post_event(&format!("bcp_get_{name}"), ParamMap::new());
                    }
                }
                None => warn!(session, "get without names"),
            },
            "set" => {
                for (key, value) in params {
                    let mut kwargs = ParamMap::new();
                    kwargs.insert("value".to_owned(), value);
                    self.host.post_event(&format!("bcp_set_{key}"), kwargs);
                }
            }
            "reset_complete" => self.host.reset_complete(),
            "external_show_start" => match take_string(&mut params, "name") {
                Some(name) => self.host.enqueue_show_start(&name, params),
                None => warn!(session, "external_show_start without a name"),
            },
            "external_show_stop" => match take_string(&mut params, "name") {
                Some(name) => self.host.enqueue_show_stop(&name),
                None => warn!(session, "external_show_stop without a name"),
            },
            "external_show_frame" => match take_string(&mut params, "name") {
                Some(name) => self.host.enqueue_show_frame(&name, params),
                None => warn!(session, "external_show_frame without a name"),
            },
            "dmd_frame" => forward_frame(self.dmd_sink.as_ref(), payload.as_deref(), command),
            "rgb_dmd_frame" => {
                forward_frame(self.rgb_dmd_sink.as_ref(), payload.as_deref(), command);
            }
            other => warn!(session, command = other, "unknown BCP command"),
        }
    }

    fn receive_switch(&mut self, session: &str, params: &ParamMap) {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            warn!(session, "switch without a name");
            return;
        };
        let Some(mut state) = params.get("state").and_then(Value::as_i64) else {
            warn!(session, name, "switch without a usable state");
            return;
        };
        if !self.host.has_switch(name) {
            warn!(session, name, "switch message with unknown switch name");
            return;
        }
        if state == -1 {
            state = if self.host.switch_active(name) { 0 } else { 1 };
        }
        self.host.process_switch(name, state, true);
    }

    // -----------------------------------------------------------------------
    // Trigger registry
    // -----------------------------------------------------------------------

    fn add_registered_trigger_event(&mut self, event: &str) {
        if self.shutting_down {
            return;
        }
        let key = event.to_lowercase();
        if self.trigger_refcounts.increment(&key) == 1 {
            let tx = self.tx.clone();
            let id = self.host.add_handler(
                &key,
                Arc::new(move |name: &str, params: &ParamMap| {
                    let _ = tx.send(RouterMsg::Trigger {
                        name: name.to_owned(),
                        params: params.clone(),
                    });
                }),
            );
            self.trigger_handlers.insert(key, id);
        }
    }

    fn remove_registered_trigger_event(&mut self, event: &str) {
        let key = event.to_lowercase();
        if self.trigger_refcounts.decrement(&key) == Some(0) {
            if let Some(id) = self.trigger_handlers.remove(&key) {
                self.host.remove_handler(&key, id);
            }
        }
    }

    fn handle_trigger(&mut self, name: &str, mut params: ParamMap) {
        if let Some(var) = name.strip_prefix("player_") {
            // The player-variable path already reports these.
            if self.host.game_active() && self.host.is_player_var(var) {
                return;
            }
        }
        params.insert("name".to_owned(), name.into());
        self.send_command("trigger", &params);
    }

    // -----------------------------------------------------------------------
    // Variable changes
    // -----------------------------------------------------------------------

    fn handle_player_var(&mut self, change: PlayerVarChange) {
        let mut params = ParamMap::new();
        params.insert("value".to_owned(), change.value);
        params.insert("prev_value".to_owned(), change.prev_value);
        params.insert("change".to_owned(), change.change);
        params.insert("player_num".to_owned(), Value::Int(change.player_num));
        if change.name == "score" {
            self.send_command("player_score", &params);
        } else if self.config.player_variables.allows(&change.name) {
            params.insert("name".to_owned(), change.name.into());
            self.send_command("player_variable", &params);
        }
    }

    fn handle_machine_var(&mut self, change: MachineVarChange) {
        if !self.config.machine_variables.allows(&change.name) {
            return;
        }
        let mut params = ParamMap::new();
        params.insert("name".to_owned(), change.name.into());
        params.insert("value".to_owned(), change.value);
        params.insert("prev_value".to_owned(), change.prev_value);
        params.insert("change".to_owned(), change.change);
        self.send_command("machine_variable", &params);
    }

    // -----------------------------------------------------------------------
    // Event map
    // -----------------------------------------------------------------------

    fn handle_event_map(
        &mut self,
        command: &str,
        template: &[(String, String)],
        kwargs: &ParamMap,
    ) {
        if template.is_empty() {
            self.send_command(command, &ParamMap::new());
            return;
        }
        let mut params = ParamMap::new();
        for (key, value) in template {
            params.insert(key.clone(), Value::Str(self.expand_template(value, kwargs)));
        }
        self.send_command(command, &params);
    }

    /// `%var%` expands to the current player variable (games only), then
    /// each bare `%kwarg` expands to the firing event's kwarg.
    fn expand_template(&self, template: &str, kwargs: &ParamMap) -> String {
        if !template.contains('%') {
            return template.to_owned();
        }
        let mut expanded = template.to_owned();
        if self.host.game_active() {
            for (name, value) in self.host.player_vars() {
                let placeholder = format!("%{name}%");
                if expanded.contains(&placeholder) {
                    expanded = expanded.replace(&placeholder, &value.to_string());
                }
            }
        }
        for (name, value) in kwargs {
            let placeholder = format!("%{name}");
            if expanded.contains(&placeholder) {
                expanded = expanded.replace(&placeholder, &value.to_string());
            }
        }
        expanded
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    fn open_connections(&mut self) {
        if self.connected || !self.sessions.is_empty() {
            warn!("transport already initialized");
            return;
        }
        for conn in self.config.connections.clone() {
            let handle = PeerSession::spawn(
                conn,
                self.tx.clone(),
                Arc::clone(&self.active_connections),
            );
            self.sessions.push(handle);
        }
        self.pending_connects = self.sessions.len();
        if self.pending_connects == 0 {
            self.transport_up();
        }
    }

    fn session_connected(&mut self, session: &str) {
        debug!(session, "peer session open");
        if !self.connected && self.pending_connects > 0 {
            self.pending_connects -= 1;
            if self.pending_connects == 0 {
                self.transport_up();
            }
        }
    }

    /// All configured peers answered: replay the machine-variable snapshot,
    /// then run whatever was waiting for the transport.
    fn transport_up(&mut self) {
        info!(connections = self.sessions.len(), "bcp transport up");
        self.connected = true;
        for (name, value) in self.host.machine_vars() {
            let mut params = ParamMap::new();
            params.insert("name".to_owned(), name.into());
            params.insert("value".to_owned(), value);
            self.send_command("machine_variable", &params);
        }
        self.flush_connection_callbacks();
    }

    fn register_connection_callback(&mut self, callback: ConnectionCallback) {
        self.connection_callbacks.push(callback);
        if self.connected {
            // Already up: run on the next tick, behind whatever is queued.
            let _ = self.tx.send(RouterMsg::FlushConnectionCallbacks);
        }
    }

    fn flush_connection_callbacks(&mut self) {
        for callback in self.connection_callbacks.drain(..) {
            callback();
        }
    }

    fn session_closed(&mut self, session: &str, reason: CloseReason) {
        let required = match self.sessions.iter().position(|h| h.name() == session) {
            Some(index) => self.sessions.remove(index).required(),
            None => true,
        };
        if !self.connected && self.pending_connects > 0 {
            // This session will never report in; stop waiting for it.
            self.pending_connects -= 1;
            if self.pending_connects == 0 && !self.sessions.is_empty() {
                self.transport_up();
            }
        }
        if self.shutting_down {
            return;
        }
        match reason {
            CloseReason::Shutdown => {}
            CloseReason::Goodbye => {
                info!(session, "peer said goodbye, stopping machine");
                self.begin_shutdown();
                self.host.request_stop();
            }
            CloseReason::Transport => {
                if required {
                    warn!(session, "lost required media controller, stopping machine");
                    self.begin_shutdown();
                    self.host.request_stop();
                } else {
                    warn!(session, "lost optional media controller, continuing");
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("bcp bridge shutting down");
        self.shutting_down = true;
        for (event, id) in self.trigger_handlers.drain() {
            self.host.remove_handler(&event, id);
        }
        self.trigger_refcounts.clear();
        for (event, id) in self.hook_handlers.drain(..) {
            self.host.remove_handler(&event, id);
        }
        for handle in &self.sessions {
            handle.stop();
        }
    }

    // -----------------------------------------------------------------------
    // DMD plumbing
    // -----------------------------------------------------------------------

    fn setup_dmds(&mut self) {
        if self.host.has_dmd() {
            let host = Arc::clone(&self.host);
            self.register_connection_callback(Box::new(move || host.configure_dmd()));
        }
        if self.host.has_rgb_dmd() {
            let host = Arc::clone(&self.host);
            self.register_connection_callback(Box::new(move || host.configure_rgb_dmd()));
        }
    }

    fn register_dmd(&mut self, sink: FrameSink, rgb: bool) {
        let command = if rgb {
            self.rgb_dmd_sink = Some(sink);
            "rgb_dmd_start"
        } else {
            self.dmd_sink = Some(sink);
            "dmd_start"
        };
        let mut params = ParamMap::new();
        params.insert("fps".to_owned(), Value::Int(i64::from(self.host.max_fps())));
        self.send_command(command, &params);
    }

    // -----------------------------------------------------------------------
    // Outbound fanout
    // -----------------------------------------------------------------------

    fn send_led_coordinates(&mut self) {
        let coordinates = self
            .host
            .led_coordinates()
            .iter()
            .map(|led| format!("{}:{},{}", led.name, led.x, led.y))
            .collect::<Vec<_>>()
            .join(";");
        let mut params = ParamMap::new();
        params.insert("led_coordinates".to_owned(), coordinates.into());
        self.send_command("set", &params);
    }

    fn send_command(&mut self, command: &str, params: &ParamMap) {
        self.broadcast(encode_command_string(command, params));
    }

    fn broadcast(&mut self, line: String) {
        for handle in &self.sessions {
            handle.send(line.clone());
        }
    }

    fn hook(
        &mut self,
        event: &str,
        make: impl Fn(&ParamMap) -> Option<RouterMsg> + Send + Sync + 'static,
    ) {
        let tx = self.tx.clone();
        let id = self.host.add_handler(
            event,
            Arc::new(move |_name: &str, params: &ParamMap| {
                if let Some(msg) = make(params) {
                    let _ = tx.send(msg);
                }
            }),
        );
        self.hook_handlers.push((event.to_owned(), id));
    }
}

fn forward_frame(sink: Option<&FrameSink>, payload: Option<&[u8]>, command: &str) {
    match (sink, payload) {
        (Some(sink), Some(bytes)) => sink(bytes),
        (None, _) => warn!(command, "frame received with no sink registered"),
        (_, None) => warn!(command, "frame received without a binary payload"),
    }
}

fn take_string(params: &mut ParamMap, key: &str) -> Option<String> {
    match params.remove(key) {
        Some(Value::Str(s)) => Some(s),
        Some(other) => {
            params.insert(key.to_owned(), other);
            None
        }
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Case-insensitive refcounts
// ---------------------------------------------------------------------------

/// Reference counts keyed case-insensitively: the key is lowercased on
/// every access, nothing else about the map is special.
#[derive(Debug, Default)]
struct CaseInsensitiveCounter {
    counts: HashMap<String, usize>,
}

impl CaseInsensitiveCounter {
    fn increment(&mut self, key: &str) -> usize {
        let count = self.counts.entry(key.to_lowercase()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remaining count after the decrement, or `None` for an absent key.
    fn decrement(&mut self, key: &str) -> Option<usize> {
        let key = key.to_lowercase();
        let count = self.counts.get_mut(&key)?;
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&key);
            return Some(0);
        }
        Some(*count)
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}
