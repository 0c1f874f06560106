//! Periodic Driver (spec.md §4.7): the async glue between the pure
//! [`Engine`] state machine and the actual serial transport. One task
//! owns the connection end to end — opening the port, feeding received
//! bytes to the engine, flushing engine-produced bytes back out, and
//! driving the 100ms status poll and 2s greeting timeout.

use crate::codec::{encode_command, encode_param_marker};
use crate::config::EngineConfig;
use crate::engine::{ConnectionState, Engine, EngineEvent};
use crate::error::EngineError;
use crate::gcode::{GcodeFrontend, SpecialCommand, StatusView, ENGINE_VERSION};
use crate::link;
use crate::markers::CmdMarker;
use crate::status::StatusSnapshot;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GREETING_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_CHANNEL_DEPTH: usize = 64;

/// What's currently known about the connection, published on every
/// change so HTTP/WS consumers can render it without polling the
/// engine directly.
#[derive(Debug, Clone)]
pub struct DriverSnapshot {
    pub state: ConnectionState,
    pub status: Option<StatusSnapshot>,
    pub job_percent: f64,
}

enum DriverCommand {
    /// Reply is the formatted response string spec.md §6 defines: `ok`,
    /// `error:<message>`, `status:<json-or-short>`, `info:<message>`, or
    /// `queue:<n>,<pct>,<n>`.
    GcodeLine(String, tokio::sync::oneshot::Sender<String>),
    Shutdown,
}

/// Handle to a running driver task. Cloning is cheap; every clone
/// shares the same background task and status feed.
#[derive(Clone)]
pub struct DriveboardHandle {
    commands: mpsc::Sender<DriverCommand>,
    snapshot: watch::Receiver<DriverSnapshot>,
}

impl DriveboardHandle {
    /// Open the serial port and start the driver task. Unlike a
    /// reconnect later in the connection's life, the *initial* open is
    /// synchronous and fatal on failure (spec.md §6): the caller is
    /// expected to exit non-zero rather than retry silently.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let port = config
            .serial_port
            .clone()
            .ok_or_else(|| EngineError::PortNotFound("no serial_port configured".to_string()))?;
        let initial = link::open(&port, config.baudrate).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (snap_tx, snap_rx) = watch::channel(DriverSnapshot {
            state: ConnectionState::Disconnected,
            status: None,
            job_percent: 100.0,
        });
        tokio::spawn(run(port, config.baudrate, Some(initial), cmd_rx, snap_tx));
        Ok(DriveboardHandle { commands: cmd_tx, snapshot: snap_rx })
    }

    pub fn subscribe(&self) -> watch::Receiver<DriverSnapshot> {
        self.snapshot.clone()
    }

    pub fn latest(&self) -> DriverSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Submit one line of G-code text for parsing and transmission.
    /// Resolves to the formatted response string spec.md §6 defines
    /// (`ok`, `error:<message>`, `status:<...>`, `info:<message>`,
    /// `queue:<n>,<pct>,<n>`) once the engine has processed the line;
    /// this does not wait for the firmware to execute it.
    pub async fn submit_gcode_line(&self, line: String) -> Result<String, EngineError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(DriverCommand::GcodeLine(line, tx))
            .await
            .map_err(|_| EngineError::NotConnected)?;
        rx.await.map_err(|_| EngineError::NotConnected)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(DriverCommand::Shutdown).await;
    }
}

/// `initial`, when `Some`, is the already-opened port from
/// [`DriveboardHandle::connect`]'s synchronous startup attempt. Every
/// subsequent connection after a link error is `None`: spec.md §7 rules
/// out automatic reconnection, so the loop instead waits for an
/// explicit `~`/`!resume` line before it reopens the port.
async fn run(
    port: String,
    baudrate: u32,
    mut initial: Option<(link::LinkReader, link::LinkWriter)>,
    mut commands: mpsc::Receiver<DriverCommand>,
    snapshot_tx: watch::Sender<DriverSnapshot>,
) {
    loop {
        let mut engine = Engine::new();
        let mut gcode = GcodeFrontend::new();

        let (mut reader, mut writer) = match initial.take() {
            Some(pair) => pair,
            None => {
                publish(&snapshot_tx, &engine);
                match wait_for_reconnect(&mut commands, &port, baudrate).await {
                    Some(pair) => pair,
                    None => return,
                }
            }
        };

        engine.begin_connecting();
        publish(&snapshot_tx, &engine);
        engine.port_opened();
        publish(&snapshot_tx, &engine);

        // spec.md §4.4: AwaitingGreeting begins only once CMD_RESET_PROTOCOL
        // and CMD_SUPERSTATUS have actually gone out over the wire.
        let mut greeting_cmd = engine.submit_control(CmdMarker::ResetProtocol);
        greeting_cmd.extend(engine.submit_control(CmdMarker::Superstatus));
        if let Err(e) = writer.write_duplicated(&greeting_cmd).await {
            tracing::warn!(reason = %e, "driveboard link closed, awaiting explicit resume");
            continue;
        }

        let mut status_timer = tokio::time::interval(STATUS_POLL_INTERVAL);
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let greeting_sleep = tokio::time::sleep(GREETING_TIMEOUT);
        tokio::pin!(greeting_sleep);
        let mut awaiting_greeting = true;

        let disconnect_reason = 'conn: loop {
            tokio::select! {
                byte = reader.read_byte() => {
                    match byte {
                        Ok(b) => {
                            let events = engine.on_byte_received(b, Instant::now());
                            if let Some(reason) = handle_events(events, &mut writer, &snapshot_tx, &engine, &mut awaiting_greeting).await {
                                break 'conn reason;
                            }
                        }
                        Err(e) => break 'conn format!("read error: {e}"),
                    }
                }
                _ = &mut greeting_sleep, if awaiting_greeting => {
                    engine.on_greeting_timeout();
                    publish(&snapshot_tx, &engine);
                    break 'conn "greeting timeout".to_string();
                }
                _ = status_timer.tick(), if !awaiting_greeting => {
                    let bytes = engine.submit_control(CmdMarker::Status);
                    if let Err(e) = writer.write_duplicated(&bytes).await {
                        break 'conn format!("write error: {e}");
                    }
                    if engine.refresh_if_stale(Instant::now()).is_some() {
                        publish(&snapshot_tx, &engine);
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(DriverCommand::GcodeLine(line, reply)) => {
                            let response = submit_gcode(&mut engine, &mut gcode, &line, &mut writer).await;
                            if engine.state() == ConnectionState::AwaitingGreeting && !awaiting_greeting {
                                // A resume-triggered protocol reset; rearm the
                                // greeting timeout exactly as at initial connect.
                                awaiting_greeting = true;
                                greeting_sleep.as_mut().reset(tokio::time::Instant::now() + GREETING_TIMEOUT);
                            }
                            publish(&snapshot_tx, &engine);
                            let _ = reply.send(response);
                        }
                        Some(DriverCommand::Shutdown) | None => return,
                    }
                }
            }
        };

        tracing::warn!(reason = %disconnect_reason, "driveboard link closed, awaiting explicit resume");
    }
}

/// Disconnected holding pattern: the only way out is an explicit
/// `~`/`!resume` line, which attempts exactly one reopen (spec.md §4.6,
/// §7). `!version` and `?` still answer normally (spec.md §4.6 step 2:
/// special lines are "effective even while disconnected"); any other
/// line falls through to step 3 and is rejected with the disconnect
/// reason.
async fn wait_for_reconnect(
    commands: &mut mpsc::Receiver<DriverCommand>,
    port: &str,
    baudrate: u32,
) -> Option<(link::LinkReader, link::LinkWriter)> {
    loop {
        match commands.recv().await {
            Some(DriverCommand::GcodeLine(line, reply)) => match GcodeFrontend::special_line(&line) {
                Some(SpecialCommand::Resume) => match link::open(port, baudrate).await {
                    Ok(pair) => {
                        let _ = reply.send("ok".to_string());
                        return Some(pair);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reconnect attempt failed");
                        let _ = reply.send(format!("error:{e}"));
                    }
                },
                Some(SpecialCommand::Stop) => {
                    tracing::warn!("stop requested while disconnected; nothing to write");
                    let _ = reply.send("ok".to_string());
                }
                Some(SpecialCommand::Pause) | Some(SpecialCommand::Unpause) => {
                    let _ = reply.send("ok".to_string());
                }
                Some(SpecialCommand::Version) => {
                    let _ = reply.send(format!("info:{ENGINE_VERSION}"));
                }
                Some(SpecialCommand::Status(view)) => {
                    let _ = reply.send(render_status(view, None));
                }
                None => {
                    let _ = reply.send("error:not connected".to_string());
                }
            },
            Some(DriverCommand::Shutdown) | None => return None,
        }
    }
}

async fn handle_events(
    events: Vec<EngineEvent>,
    writer: &mut link::LinkWriter,
    snapshot_tx: &watch::Sender<DriverSnapshot>,
    engine: &Engine,
    awaiting_greeting: &mut bool,
) -> Option<String> {
    let mut disconnect = None;
    for event in events {
        match event {
            EngineEvent::WriteBytes(bytes) => {
                if let Err(e) = writer.write_duplicated(&bytes).await {
                    disconnect = Some(format!("write error: {e}"));
                }
            }
            EngineEvent::StatusUpdated(_) | EngineEvent::Stopped(_) | EngineEvent::Resumed => {
                publish(snapshot_tx, engine);
            }
            EngineEvent::Connected { firmware_version } => {
                *awaiting_greeting = false;
                tracing::info!(firmware_version, "driveboard connected");
                publish(snapshot_tx, engine);
            }
            EngineEvent::Disconnected { reason } => {
                disconnect = Some(reason);
            }
            EngineEvent::FramingError { marker, accumulated } => {
                tracing::warn!(?marker, ?accumulated, "protocol framing error");
            }
        }
    }
    disconnect
}

/// Render a `?`/`?full`/`?queue` response. `snapshot` is `None` while
/// disconnected, since a "connected" snapshot is meaningless then.
fn render_status(view: StatusView, snapshot: Option<&StatusSnapshot>) -> String {
    let snapshot = snapshot.cloned().unwrap_or_else(StatusSnapshot::blank);
    match view {
        StatusView::Short => format!("status:{}", snapshot.short()),
        // The boxed dashboard (StatusSnapshot's Display impl) rather than
        // JSON: ?full is the human-facing sibling of GET /status.
        StatusView::Full => format!("status:\n{snapshot}"),
        StatusView::Queue => {
            format!("queue:{},{:.1},{}", snapshot.backend_queued, snapshot.job_percent, snapshot.firmbuf_used)
        }
    }
}

/// Process one line of submitted G-code and produce the spec.md §6
/// response string. Step numbers below match spec.md §4.6.
async fn submit_gcode(
    engine: &mut Engine,
    gcode: &mut GcodeFrontend,
    line: &str,
    writer: &mut link::LinkWriter,
) -> String {
    // Step 2: special lines are effective even while disconnected.
    if let Some(special) = GcodeFrontend::special_line(line) {
        return match special {
            SpecialCommand::Stop => {
                let bytes = engine.request_stop();
                match writer.write_duplicated(&bytes).await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error:{e}"),
                }
            }
            SpecialCommand::Resume => {
                let bytes = engine.request_resume();
                match writer.write_duplicated(&bytes).await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error:{e}"),
                }
            }
            SpecialCommand::Pause => {
                engine.pause();
                "ok".to_string()
            }
            SpecialCommand::Unpause => {
                let bytes = engine.unpause();
                match writer.write_duplicated(&bytes).await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error:{e}"),
                }
            }
            SpecialCommand::Version => format!("info:{ENGINE_VERSION}"),
            SpecialCommand::Status(view) => render_status(view, engine.last_snapshot()),
        };
    }

    // Step 3: everything else requires a connected, pumping engine.
    if matches!(
        engine.state(),
        ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::AwaitingGreeting
    ) {
        let reason = engine.disconnect_reason().unwrap_or("not connected");
        return format!("error:{reason}");
    }

    let parsed = match gcode.gcode_line(line) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return "ok".to_string(),
        Err(e) => return format!("error:{e}"),
    };

    let mut wire = Vec::new();
    for (marker, value) in &parsed.params {
        wire.extend(encode_param_marker((*marker).into(), *value));
    }
    if let Some(command) = parsed.command {
        wire.extend(encode_command(command.into()));
    }
    if let Some(raster) = &parsed.raster {
        wire.extend(crate::codec::encode_raster(raster));
    }

    let ready = engine.submit(&wire);
    match writer.write_duplicated(&ready).await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error:{e}"),
    }
}

fn publish(tx: &watch::Sender<DriverSnapshot>, engine: &Engine) {
    let _ = tx.send(DriverSnapshot {
        state: engine.state(),
        status: engine.last_snapshot().cloned(),
        job_percent: engine.job_percent(),
    });
}
