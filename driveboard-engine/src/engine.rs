//! The Protocol Engine (spec.md §4.4): a synchronous, I/O-free state
//! machine over [`Codec`] events. Kept free of `tokio`/`tokio-serial` so
//! it can be driven and tested deterministically; [`crate::link`] and
//! [`crate::driver`] supply the actual serial I/O and timers.

use crate::buffer::BufferTracker;
use crate::codec::{Codec, CodecEvent};
use crate::markers::{CmdMarker, InfoFlag, InfoValue, StatusMarker, StopError};
use crate::status::{PendingStatus, StatusSnapshot};
use std::time::Instant;

/// Firmware must report this value (within tolerance) in its startup
/// greeting parameter for the connection to be accepted.
pub const GREETING_MAGIC: f64 = 123.456;
pub const GREETING_TOLERANCE: f64 = 0.001;

/// Coarse connection lifecycle (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingGreeting,
    Running,
    Paused,
    Stopped,
    Resuming,
}

/// Something the engine wants its caller (the async driver) to act on:
/// bytes to write, a status snapshot to publish, or a lifecycle
/// transition to log/surface.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Bytes ready to go out over the wire. The driver is responsible
    /// for the double-byte transmission discipline (spec.md §9).
    WriteBytes(Vec<u8>),
    StatusUpdated(StatusSnapshot),
    Connected { firmware_version: f64 },
    Disconnected { reason: String },
    Stopped(Vec<String>),
    Resumed,
    FramingError { marker: Option<u8>, accumulated: Vec<u8> },
}

pub struct Engine {
    state: ConnectionState,
    codec: Codec,
    buffer: BufferTracker,
    pending: PendingStatus,
    firmware_version: Option<f64>,
    last_snapshot: Option<StatusSnapshot>,
    /// Running maximum of `buffer.queued_len()` seen since the queue was
    /// last empty; the denominator of `job_percent` (spec.md §4.5).
    job_max: usize,
    last_disconnect_reason: Option<String>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            state: ConnectionState::Disconnected,
            codec: Codec::new(),
            buffer: BufferTracker::new(),
            pending: PendingStatus::new(),
            firmware_version: None,
            last_snapshot: None,
            job_max: 0,
            last_disconnect_reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_snapshot(&self) -> Option<&StatusSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Reason surfaced by the most recent `Disconnected` transition, if
    /// any (spec.md §4.6 step 3: `error:<disconnect reason>`).
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.last_disconnect_reason.as_deref()
    }

    /// Progress through the currently-queued job: `100 * (1 -
    /// bytes_waiting / jobsize)`, where `jobsize` is the running maximum
    /// of bytes still waiting behind the credit wall observed since the
    /// queue was last empty (spec.md §4.5). `100.0` once nothing is
    /// queued (including before any job has been submitted).
    pub fn job_percent(&self) -> f64 {
        if self.job_max == 0 {
            return 100.0;
        }
        100.0 * (1.0 - self.buffer.queued_len() as f64 / self.job_max as f64)
    }

    /// Track the running-maximum denominator for `job_percent`, called
    /// after every operation that can change `buffer.queued_len()`.
    fn track_job_size(&mut self) {
        let queued = self.buffer.queued_len();
        if queued == 0 {
            self.job_max = 0;
        } else {
            self.job_max = self.job_max.max(queued);
        }
    }

    /// Whether the drain pump may move queued bytes to the wire right now
    /// (spec.md §4.4 submission protocol, step 3: "while not paused, not
    /// stopped").
    fn can_pump(&self) -> bool {
        matches!(self.state, ConnectionState::Running)
    }

    /// Reset all per-connection protocol state. Called on every fresh
    /// connection attempt and whenever the firmware signals a hard stop
    /// that requires renegotiating the greeting.
    pub fn reset_protocol(&mut self) {
        self.codec = Codec::new();
        self.buffer.reset();
        self.pending.reset();
        self.firmware_version = None;
        self.last_snapshot = None;
        self.job_max = 0;
    }

    pub fn begin_connecting(&mut self) {
        self.reset_protocol();
        self.state = ConnectionState::Connecting;
    }

    /// Firmware port opened; now waiting for the startup greeting.
    pub fn port_opened(&mut self) {
        self.state = ConnectionState::AwaitingGreeting;
    }

    /// The 2s greeting timer elapsed with no `INFO_STARTUP_GREETING`
    /// observed.
    pub fn on_greeting_timeout(&mut self) -> EngineEvent {
        self.disconnect("greeting timeout".to_string())
    }

    /// Re-derive the error-report precedence on the current snapshot if
    /// it has gone stale (spec.md §3, §4.7: ">0.5s without STATUS_END
    /// triggers a Status Model refresh even without new firmware data").
    /// A no-op while nothing has ever been reported yet, or while the
    /// existing snapshot is still fresh.
    pub fn refresh_if_stale(&mut self, now: Instant) -> Option<EngineEvent> {
        let snapshot = self.last_snapshot.as_ref()?;
        if !snapshot.is_stale(now) {
            return None;
        }
        let refreshed = snapshot.clone().with_error_report(false, now);
        self.last_snapshot = Some(refreshed.clone());
        Some(EngineEvent::StatusUpdated(refreshed))
    }

    fn disconnect(&mut self, reason: String) -> EngineEvent {
        self.state = ConnectionState::Disconnected;
        self.last_disconnect_reason = Some(reason.clone());
        EngineEvent::Disconnected { reason }
    }

    /// Submit outbound protocol bytes (already codec-encoded) for
    /// transmission. Always enqueues; only drains onto the wire when the
    /// drain pump is allowed to run (spec.md §4.4: submissions made while
    /// `Paused` or `Stopped` are held in the firmbuf-queue rather than
    /// rejected, and released once the engine returns to `Running`).
    pub fn submit(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.buffer.enqueue(bytes);
        self.track_job_size();
        if !self.can_pump() {
            return Vec::new();
        }
        let out = self.buffer.drain();
        self.track_job_size();
        out
    }

    /// Submit a bare control command (`CMD_STOP`, `CMD_RESUME`, ...).
    /// Control bytes bypass buffer credit accounting entirely.
    pub fn submit_control(&mut self, marker: CmdMarker) -> Vec<u8> {
        debug_assert!(marker.is_control());
        vec![marker.into()]
    }

    /// `!` / `!stop`. Only writes `CMD_STOP` to the wire; the engine does
    /// not transition to `Stopped` until `on_status_end` observes the
    /// firmware's own `STOPERROR_*` in a committed status frame (spec.md
    /// §4.4). Transitioning here instead would skip that frame's
    /// `clear_queue()` and let bytes queued before the stop survive a
    /// later resume.
    pub fn request_stop(&mut self) -> Vec<u8> {
        self.submit_control(CmdMarker::Stop)
    }

    /// `~` / `!resume`. If the last committed status still shows
    /// `rx_buffer_overflow` or `transmission_error`, the host state is
    /// out of sync with the firmware and a resume alone cannot recover
    /// it: issue a full protocol reset first (spec.md §4.4 submission
    /// protocol, step 1) and let the greeting sequence re-establish
    /// `Running` before accepting new work.
    pub fn request_resume(&mut self) -> Vec<u8> {
        let needs_reset = self
            .last_snapshot
            .as_ref()
            .map(|s| s.stops.iter().any(|r| r == "rx_buffer_overflow" || r == "transmission_error"))
            .unwrap_or(false);
        if needs_reset {
            self.reset_protocol();
            self.state = ConnectionState::AwaitingGreeting;
            let mut out = self.submit_control(CmdMarker::ResetProtocol);
            out.extend(self.submit_control(CmdMarker::Superstatus));
            return out;
        }
        self.state = ConnectionState::Resuming;
        self.submit_control(CmdMarker::Resume)
    }

    /// `!pause`/`!unpause`: a host-side hold on dispatching further
    /// G-code, distinct from `CMD_STOP`/`CMD_RESUME` which the firmware
    /// itself understands. No wire traffic is generated.
    pub fn pause(&mut self) {
        if self.state == ConnectionState::Running {
            self.state = ConnectionState::Paused;
        }
    }

    /// Returns any bytes the drain pump releases now that the hold is
    /// lifted; the caller is responsible for writing them to the link.
    pub fn unpause(&mut self) -> Vec<u8> {
        if self.state != ConnectionState::Paused {
            return Vec::new();
        }
        self.state = ConnectionState::Running;
        let out = self.buffer.drain();
        self.track_job_size();
        out
    }

    /// Feed one received byte and translate whatever codec event (if
    /// any) results into engine-level events.
    pub fn on_byte_received(&mut self, byte: u8, now: Instant) -> Vec<EngineEvent> {
        match self.codec.feed(byte) {
            None => Vec::new(),
            Some(CodecEvent::ChunkProcessed) => {
                self.buffer.on_chunk_processed();
                if !self.can_pump() {
                    return Vec::new();
                }
                let drained = self.buffer.drain();
                self.track_job_size();
                if drained.is_empty() { Vec::new() } else { vec![EngineEvent::WriteBytes(drained)] }
            }
            Some(CodecEvent::StatusEnd) => vec![self.on_status_end(now)],
            Some(CodecEvent::StopError(stop)) => {
                self.pending.record_stop(stop);
                Vec::new()
            }
            Some(CodecEvent::InfoFlag(flag)) => {
                match flag {
                    InfoFlag::IdleYes => self.pending.idle = true,
                    InfoFlag::DoorOpen => self.pending.door_open = true,
                    InfoFlag::ChillerOff => self.pending.chiller_off = true,
                    InfoFlag::Unknown(_) => {}
                }
                Vec::new()
            }
            Some(CodecEvent::Parameter(marker, value)) => self.on_parameter(marker, value),
            Some(CodecEvent::UnknownFlow(_)) => Vec::new(),
            Some(CodecEvent::FramingError { marker, accumulated }) => {
                vec![EngineEvent::FramingError { marker, accumulated }]
            }
        }
    }

    fn on_parameter(&mut self, marker: InfoValue, value: f64) -> Vec<EngineEvent> {
        match marker {
            InfoValue::StartupGreeting => self.on_startup_greeting(value),
            InfoValue::Version => {
                self.firmware_version = Some(value / 100.0);
                Vec::new()
            }
            InfoValue::PosX => {
                self.pending.pos_x = Some(value);
                Vec::new()
            }
            InfoValue::PosY => {
                self.pending.pos_y = Some(value);
                Vec::new()
            }
            InfoValue::PosZ => {
                self.pending.pos_z = Some(value);
                Vec::new()
            }
            InfoValue::BufferUnderrun => {
                self.pending.underruns = Some(value);
                Vec::new()
            }
            InfoValue::StackClearance => {
                self.pending.stackclear = Some(value);
                Vec::new()
            }
            InfoValue::DelayedMicrosteps => {
                self.pending.delayed_microsteps = Some(value);
                Vec::new()
            }
            InfoValue::Unknown(_) => Vec::new(),
        }
    }

    fn on_startup_greeting(&mut self, value: f64) -> Vec<EngineEvent> {
        if (value - GREETING_MAGIC).abs() >= GREETING_TOLERANCE {
            return vec![self.disconnect(format!("bad greeting value {value}"))];
        }
        if self.buffer.used() != 0 {
            // The firmware must start with an empty receive buffer; a
            // nonzero credit count here means we're out of sync with a
            // still-running firmware and must not proceed.
            return vec![self.disconnect("firmware buffer not empty at greeting".to_string())];
        }
        self.state = ConnectionState::Running;
        vec![EngineEvent::Connected { firmware_version: self.firmware_version.unwrap_or(0.0) }]
    }

    fn on_status_end(&mut self, now: Instant) -> EngineEvent {
        let snapshot = StatusSnapshot::from_cycle(
            &self.pending,
            self.buffer.used(),
            self.buffer.queued_len(),
            self.buffer.is_drained(),
            self.job_percent(),
            self.firmware_version,
        )
        .with_error_report(false, now);

        let stops = snapshot.stops.clone();
        self.pending.reset();
        self.last_snapshot = Some(snapshot.clone());

        match self.state {
            ConnectionState::Running if !stops.is_empty() => {
                self.state = ConnectionState::Stopped;
                self.buffer.clear_queue();
                self.track_job_size();
                EngineEvent::Stopped(stops)
            }
            ConnectionState::Resuming => {
                // Absorb exactly one status frame here: the firmware may
                // emit one last stale stop-error report if its status send
                // overtook our CMD_RESUME (spec.md §9, "~ resume race").
                // Only re-enter Stopped if stop errors are still present
                // on this first post-resume frame.
                if stops.is_empty() {
                    self.state = ConnectionState::Running;
                    EngineEvent::Resumed
                } else {
                    self.state = ConnectionState::Stopped;
                    self.buffer.clear_queue();
                    self.track_job_size();
                    EngineEvent::Stopped(stops)
                }
            }
            _ => EngineEvent::StatusUpdated(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_param(engine: &mut Engine, marker: InfoValue, value: f64) -> Vec<EngineEvent> {
        let bytes = crate::codec::encode_parameter(value);
        for b in bytes {
            assert!(engine.on_byte_received(b, Instant::now()).is_empty());
        }
        engine.on_byte_received(marker.into(), Instant::now())
    }

    #[test]
    fn greeting_with_correct_magic_transitions_to_running() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        assert_eq!(engine.state(), ConnectionState::Running);
    }

    #[test]
    fn greeting_with_wrong_magic_disconnects() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, 1.0);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn greeting_with_outstanding_buffer_credit_disconnects() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        engine.submit(&[CmdMarker::LineSeek.into()]);
        // forcibly simulate outstanding credit without a CHUNK_PROCESSED
        engine.buffer.used_for_test_only_set(10);
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn greeting_timeout_disconnects() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        let event = engine.on_greeting_timeout();
        assert!(matches!(event, EngineEvent::Disconnected { .. }));
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn status_end_with_stops_transitions_to_stopped() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.on_byte_received(StopError::LimitHitX1.into(), Instant::now());
        let events = engine.on_byte_received(StatusMarker::End.into(), Instant::now());
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::Stopped(stops) => assert_eq!(stops, &vec!["limit_hit_x1".to_string()]),
            other => panic!("expected Stopped, got {other:?}"),
        }
        assert_eq!(engine.state(), ConnectionState::Stopped);
    }

    #[test]
    fn chunk_processed_drains_queued_bytes_up_to_credit() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.buffer.used_for_test_only_set(crate::buffer::FIRMBUF_CAPACITY);
        engine.submit(&[1, 2, 3]);
        let events = engine.on_byte_received(CmdMarker::ChunkProcessed.into(), Instant::now());
        assert!(events.iter().any(|e| matches!(e, EngineEvent::WriteBytes(_))));
    }

    #[test]
    fn job_percent_reaches_100_once_drained() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        let out = engine.submit(&[1, 2, 3]);
        assert_eq!(out.len(), 3);
        assert_eq!(engine.job_percent(), 100.0);
    }

    #[test]
    fn paused_submissions_enqueue_but_do_not_reach_the_wire() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.pause();
        let out = engine.submit(&[1, 2, 3]);
        assert!(out.is_empty(), "paused engine must hold bytes, not release them");
        assert!(engine.job_percent() < 100.0, "queued-but-undrained bytes must show job progress below 100%");

        let released = engine.unpause();
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(engine.job_percent(), 100.0);
    }

    #[test]
    fn stopped_submissions_enqueue_but_do_not_reach_the_wire() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.on_byte_received(StopError::LimitHitX1.into(), Instant::now());
        engine.on_byte_received(StatusMarker::End.into(), Instant::now());
        assert_eq!(engine.state(), ConnectionState::Stopped);

        let out = engine.submit(&[9, 9, 9]);
        assert!(out.is_empty(), "stopped engine must hold submissions, not release them");
    }

    #[test]
    fn stale_snapshot_is_refreshed_without_a_new_status_frame() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.on_byte_received(StatusMarker::End.into(), Instant::now());
        assert!(engine.last_snapshot().unwrap().error_report.is_none());

        let later = Instant::now() + std::time::Duration::from_millis(600);
        let event = engine.refresh_if_stale(later);
        assert!(matches!(event, Some(EngineEvent::StatusUpdated(_))));
        assert_eq!(
            engine.last_snapshot().unwrap().error_report.as_deref(),
            Some("last status update is too old")
        );
    }

    #[test]
    fn fresh_snapshot_is_not_refreshed() {
        let mut engine = Engine::new();
        engine.begin_connecting();
        engine.port_opened();
        feed_param(&mut engine, InfoValue::StartupGreeting, GREETING_MAGIC);
        engine.on_byte_received(StatusMarker::End.into(), Instant::now());
        assert!(engine.refresh_if_stale(Instant::now()).is_none());
    }
}
