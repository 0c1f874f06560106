//! INI configuration loader for the backend (`backend/config.py` /
//! `backend/backend.py`), covering the engine's serial settings and
//! the network surface's listen ports.
//!
//! spec.md §6 documents the `[backend]` section's keys outright:
//! `network_port`, `debug`, `public`. The original's `network_port`
//! (default `4445`) is the line-oriented gcode TCP port; its
//! `websocket_port` (default `8989`, `backend/config.py`) is the
//! HTTP/WebSocket port — spec.md doesn't assign that one its own INI
//! key name, so it is read under the original's own name rather than
//! invented here.

use crate::error::BackendError;
use driveboard_engine::EngineConfig;
use ini::Ini;

pub const DEFAULT_HTTP_PORT: u16 = 8989;
pub const DEFAULT_GCODE_TCP_PORT: u16 = 4445;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub driveboard: EngineConfig,
    /// Serves the HTTP status/gcode routes and the WebSocket status push.
    /// INI key `websocket_port` (`backend/config.py`'s name for it).
    pub http_port: u16,
    /// Line-oriented TCP port accepting raw G-code, matching the
    /// original's `network_port` (`backend/backend.py`'s `app.listen`).
    pub gcode_tcp_port: u16,
    /// `[backend] debug` — original's `Application(debug=...)` tornado
    /// flag; here, forces the tracing filter's floor to `debug`
    /// regardless of `-v` verbosity.
    pub debug: bool,
    /// `[backend] public` — original's bind-address switch
    /// (`backend/backend.py`'s `addr = '' if public else '127.0.0.1'`).
    /// `false` binds `127.0.0.1` only; `true` binds `0.0.0.0`.
    pub public: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            driveboard: EngineConfig::default(),
            http_port: DEFAULT_HTTP_PORT,
            gcode_tcp_port: DEFAULT_GCODE_TCP_PORT,
            debug: false,
            public: false,
        }
    }
}

impl BackendConfig {
    /// The address to bind both listeners to, per `public` (spec.md §6,
    /// `backend/backend.py`'s `addr` selection).
    pub fn bind_host(&self) -> &'static str {
        if self.public { "0.0.0.0" } else { "127.0.0.1" }
    }

    /// Load from an INI document with `[driveboard]`, `[backend]`, and
    /// an informational `[original]` section (kept only for operators
    /// migrating a config file from the original software; unrecognized
    /// keys there are ignored).
    pub fn load(path: &str) -> Result<Self, BackendError> {
        let ini = Ini::load_from_file(path).map_err(|e| BackendError::Config(e.to_string()))?;
        let mut config = BackendConfig::default();

        if let Some(section) = ini.section(Some("driveboard")) {
            if let Some(port) = section.get("serial_port") {
                config.driveboard.serial_port = Some(port.to_string());
            }
            if let Some(baud) = section.get("baudrate") {
                config.driveboard.baudrate =
                    baud.parse().map_err(|_| BackendError::Config(format!("invalid baudrate: {baud}")))?;
            }
        }

        if let Some(section) = ini.section(Some("backend")) {
            if let Some(port) = section.get("network_port") {
                config.gcode_tcp_port = port
                    .parse()
                    .map_err(|_| BackendError::Config(format!("invalid network_port: {port}")))?;
            }
            if let Some(port) = section.get("websocket_port") {
                config.http_port =
                    port.parse().map_err(|_| BackendError::Config(format!("invalid websocket_port: {port}")))?;
            }
            if let Some(debug) = section.get("debug") {
                config.debug =
                    parse_bool(debug).ok_or_else(|| BackendError::Config(format!("invalid debug: {debug}")))?;
            }
            if let Some(public) = section.get("public") {
                config.public =
                    parse_bool(public).ok_or_else(|| BackendError::Config(format!("invalid public: {public}")))?;
            }
        }

        Ok(config)
    }
}

/// INI has no native boolean type; accept the same spellings
/// Python's `configparser.getboolean` does.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
