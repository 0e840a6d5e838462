//! Bridge configuration loading.
//!
//! The `[bcp]` TOML section drives the bridge. A missing section (or a
//! missing `connections` table) is not an error: the bridge quietly
//! disables itself and every public operation becomes a no-op.
//!
//! # Shape
//! ```toml
//! [bcp.connections.local_display]
//! host = "127.0.0.1"            # required
//! port = 5050                   # required
//! required = true               # loss of this peer stops the machine
//! connect_timeout_ms = 30000
//!
//! [bcp.event_map.jackpot_lit]
//! command = "show_jackpot"
//! [bcp.event_map.jackpot_lit.params]
//! label = "Jackpot for %num!"
//!
//! [bcp]
//! player_variables = ["score", "bonus"]   # or ["__all__"]
//! machine_variables = ["__all__"]
//! ```

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BcpConfig {
    pub connections: Vec<ConnectionConfig>,
    pub event_map: Vec<EventMapEntry>,
    pub player_variables: VarFilter,
    pub machine_variables: VarFilter,
}

/// One configured peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// When true (the default), transport loss of this peer stops the whole
    /// machine; when false the peer is dropped and the game continues.
    pub required: bool,
    /// Overall deadline for the initial connect, retries included.
    pub connect_timeout: Duration,
}

/// One `event_map` entry: a host event that fires a configured command.
#[derive(Debug, Clone)]
pub struct EventMapEntry {
    pub event: String,
    pub command: String,
    /// Literal parameter templates; `%var%` expands to a player variable,
    /// `%kwarg` to an event kwarg.
    pub params: Vec<(String, String)>,
}

/// Which variable names are forwarded to peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VarFilter {
    /// Variable sending is off (key absent or empty).
    #[default]
    Disabled,
    /// `__all__`: every variable is forwarded.
    All,
    /// Only the listed names are forwarded.
    Whitelist(BTreeSet<String>),
}

impl VarFilter {
    /// Whether this class of variables is sent at all.
    pub fn sending(&self) -> bool {
        !matches!(self, VarFilter::Disabled)
    }

    /// Whether a specific variable name passes the filter.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            VarFilter::Disabled => false,
            VarFilter::All => true,
            VarFilter::Whitelist(names) => names.contains(name),
        }
    }

    /// The explicit whitelist, empty for `Disabled` and `All`.
    pub fn whitelist(&self) -> impl Iterator<Item = &str> {
        match self {
            VarFilter::Whitelist(names) => Some(names.iter().map(String::as_str)),
            _ => None,
        }
        .into_iter()
        .flatten()
    }

    fn from_names(names: Option<Vec<String>>) -> VarFilter {
        match names {
            None => VarFilter::Disabled,
            Some(names) if names.is_empty() => VarFilter::Disabled,
            Some(names) if names.iter().any(|n| n == "__all__") => VarFilter::All,
            Some(names) => VarFilter::Whitelist(names.into_iter().collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawRoot {
    bcp: Option<RawBcp>,
}

#[derive(Debug, Deserialize)]
struct RawBcp {
    connections: Option<BTreeMap<String, RawConnection>>,
    event_map: Option<BTreeMap<String, RawEventMapEntry>>,
    player_variables: Option<Vec<String>>,
    machine_variables: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    host: Option<String>,
    port: Option<u16>,
    required: Option<bool>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEventMapEntry {
    command: Option<String>,
    params: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a TOML file. `Ok(None)` means the machine has no
/// `[bcp]` section (or no connections table) and the bridge stays disabled.
pub fn load_config_from_path(path: &Path) -> Result<Option<BcpConfig>, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load bridge config from a TOML string. See [`load_config_from_path`].
pub fn load_config_from_str(toml_str: &str) -> Result<Option<BcpConfig>, ConfigError> {
    let raw: RawRoot = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let Some(raw_bcp) = raw.bcp else {
        return Ok(None);
    };
    let Some(raw_connections) = raw_bcp.connections else {
        return Ok(None);
    };

    let mut connections = Vec::with_capacity(raw_connections.len());
    for (name, raw_conn) in raw_connections {
        let host = raw_conn
            .host
            .ok_or_else(|| ConfigError::MissingField(format!("bcp.connections.{name}.host")))?;
        let port = raw_conn
            .port
            .ok_or_else(|| ConfigError::MissingField(format!("bcp.connections.{name}.port")))?;
        if port == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "bcp.connections.{name}.port must be non-zero"
            )));
        }
        connections.push(ConnectionConfig {
            name,
            host,
            port,
            required: raw_conn.required.unwrap_or(true),
            connect_timeout: Duration::from_millis(
                raw_conn.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
        });
    }

    let mut event_map = Vec::new();
    for (event, raw_entry) in raw_bcp.event_map.unwrap_or_default() {
        let command = raw_entry
            .command
            .ok_or_else(|| ConfigError::MissingField(format!("bcp.event_map.{event}.command")))?;
        event_map.push(EventMapEntry {
            event,
            command,
            params: raw_entry.params.unwrap_or_default().into_iter().collect(),
        });
    }

    Ok(Some(BcpConfig {
        connections,
        event_map,
        player_variables: VarFilter::from_names(raw_bcp.player_variables),
        machine_variables: VarFilter::from_names(raw_bcp.machine_variables),
    }))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bcp_section_disables_quietly() {
        assert!(load_config_from_str("").unwrap().is_none());
        assert!(
            load_config_from_str("[other]\nkey = 1\n")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn missing_connections_disables_quietly() {
        let cfg = load_config_from_str("[bcp]\nplayer_variables = [\"score\"]\n").unwrap();
        assert!(cfg.is_none());
    }

    #[test]
    fn minimal_connection_gets_defaults() {
        let cfg = load_config_from_str(
            "[bcp.connections.local_display]\nhost = \"127.0.0.1\"\nport = 5050\n",
        )
        .unwrap()
        .expect("configured");

        assert_eq!(cfg.connections.len(), 1);
        let conn = &cfg.connections[0];
        assert_eq!(conn.name, "local_display");
        assert_eq!(conn.host, "127.0.0.1");
        assert_eq!(conn.port, 5050);
        assert!(conn.required);
        assert_eq!(conn.connect_timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.player_variables, VarFilter::Disabled);
        assert_eq!(cfg.machine_variables, VarFilter::Disabled);
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = load_config_from_str("[bcp.connections.a]\nport = 5050\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(field) if field.contains("a.host")));
    }

    #[test]
    fn zero_port_is_rejected() {
        let err =
            load_config_from_str("[bcp.connections.a]\nhost = \"h\"\nport = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn var_filters_parse_all_and_whitelist() {
        let cfg = load_config_from_str(
            r#"
[bcp]
player_variables = ["score", "bonus"]
machine_variables = ["__all__"]

[bcp.connections.mc]
host = "localhost"
port = 5050
"#,
        )
        .unwrap()
        .expect("configured");

        assert!(cfg.player_variables.sending());
        assert!(cfg.player_variables.allows("score"));
        assert!(!cfg.player_variables.allows("credits"));
        assert_eq!(
            cfg.player_variables.whitelist().collect::<Vec<_>>(),
            vec!["bonus", "score"]
        );

        assert_eq!(cfg.machine_variables, VarFilter::All);
        assert!(cfg.machine_variables.allows("anything"));
        assert_eq!(cfg.machine_variables.whitelist().count(), 0);
    }

    #[test]
    fn event_map_entries_parse_with_templates() {
        let cfg = load_config_from_str(
            r#"
[bcp.connections.mc]
host = "localhost"
port = 5050

[bcp.event_map.jackpot_lit]
command = "show_jackpot"

[bcp.event_map.jackpot_lit.params]
label = "Jackpot for %num!"
"#,
        )
        .unwrap()
        .expect("configured");

        assert_eq!(cfg.event_map.len(), 1);
        let entry = &cfg.event_map[0];
        assert_eq!(entry.event, "jackpot_lit");
        assert_eq!(entry.command, "show_jackpot");
        assert_eq!(
            entry.params,
            vec![("label".to_owned(), "Jackpot for %num!".to_owned())]
        );
    }

    #[test]
    fn event_map_without_command_is_an_error() {
        let err = load_config_from_str(
            r#"
[bcp.connections.mc]
host = "localhost"
port = 5050

[bcp.event_map.broken]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(field) if field.contains("broken")));
    }
}
