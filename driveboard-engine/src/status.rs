//! Status Model (spec.md §4.5): the firmware's periodic status report,
//! assembled from codec events between one `STATUS_END` and the next,
//! and the error-report precedence rules applied on top of it.

use crate::markers::StopError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Status considered stale once this long has passed without a fresh
/// `STATUS_END`.
pub const STATUS_STALE_AFTER: Duration = Duration::from_millis(500);

/// Accumulator for the fields reported between two `STATUS_END` markers.
/// Mutated in place by the engine as codec events arrive, then folded
/// into a [`StatusSnapshot`] at `STATUS_END`.
#[derive(Debug, Default)]
pub struct PendingStatus {
    pub idle: bool,
    pub door_open: bool,
    pub chiller_off: bool,
    pub pos_x: Option<f64>,
    pub pos_y: Option<f64>,
    pub pos_z: Option<f64>,
    pub underruns: Option<f64>,
    pub stackclear: Option<f64>,
    pub delayed_microsteps: Option<f64>,
    /// Stop/error markers observed this status cycle, in first-seen
    /// order, excluding `STOPERROR_OK`.
    pub stops: Vec<StopError>,
    stops_seen: BTreeSet<u8>,
}

impl PendingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stop(&mut self, stop: StopError) {
        if matches!(stop, StopError::Ok) {
            return;
        }
        if self.stops_seen.insert(stop.into()) {
            self.stops.push(stop);
        }
    }

    pub fn reset(&mut self) {
        *self = PendingStatus::default();
    }
}

/// A point-in-time snapshot of firmware status, as published to HTTP/WS
/// consumers and to the G-code front-end's `?full` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ready: bool,
    /// Bytes currently in flight toward the firmware's receive buffer
    /// (spec.md §3 `firmbuf_used`).
    pub firmbuf_used: usize,
    pub firmbuf_percent: f64,
    /// Bytes still queued host-side, behind the credit wall, waiting to
    /// be released to the firmware (spec.md §3 `backend_queued`).
    pub backend_queued: usize,
    /// Progress through the currently-queued job (spec.md §4.5).
    pub job_percent: f64,
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
    pub underruns: f64,
    pub stackclear: f64,
    pub delayed_microsteps: f64,
    pub door_open: bool,
    pub chiller_off: bool,
    pub stops: Vec<String>,
    /// `None` when serialized disconnected/stale error precedence has
    /// nothing to report.
    pub error_report: Option<String>,
    pub firmware_version: Option<f64>,
    #[serde(skip)]
    pub received_at: Option<Instant>,
}

impl StatusSnapshot {
    /// Build from a just-closed [`PendingStatus`] cycle. `firmbuf_used`,
    /// `backend_queued` and `queue_drained` come from the
    /// [`crate::buffer::BufferTracker`]; `job_percent` from the engine's
    /// running-maximum tracker; `firmware_version` is sticky across
    /// cycles (set once by `INFO_VERSION`, not re-sent every cycle).
    pub fn from_cycle(
        pending: &PendingStatus,
        firmbuf_used: usize,
        backend_queued: usize,
        queue_drained: bool,
        job_percent: f64,
        firmware_version: Option<f64>,
    ) -> Self {
        let firmbuf_percent = 100.0
            * (firmbuf_used.saturating_sub(crate::buffer::CHUNK)) as f64
            / (crate::buffer::FIRMBUF_CAPACITY - crate::buffer::CHUNK) as f64;

        StatusSnapshot {
            ready: pending.idle && queue_drained,
            firmbuf_used,
            firmbuf_percent,
            backend_queued,
            job_percent,
            pos_x: pending.pos_x.unwrap_or(0.0),
            pos_y: pending.pos_y.unwrap_or(0.0),
            pos_z: pending.pos_z.unwrap_or(0.0),
            underruns: pending.underruns.unwrap_or(0.0),
            stackclear: pending.stackclear.unwrap_or(0.0),
            delayed_microsteps: pending.delayed_microsteps.unwrap_or(0.0),
            door_open: pending.door_open,
            chiller_off: pending.chiller_off,
            stops: pending.stops.iter().map(|s| s.reason()).collect(),
            error_report: None,
            firmware_version,
            received_at: Some(Instant::now()),
        }
    }

    /// A placeholder snapshot for when there has never been a connected
    /// status cycle to report (e.g. `?full` issued while disconnected).
    pub fn blank() -> Self {
        StatusSnapshot {
            ready: false,
            firmbuf_used: 0,
            firmbuf_percent: 0.0,
            backend_queued: 0,
            job_percent: 100.0,
            pos_x: 0.0,
            pos_y: 0.0,
            pos_z: 0.0,
            underruns: 0.0,
            stackclear: 0.0,
            delayed_microsteps: 0.0,
            door_open: false,
            chiller_off: false,
            stops: Vec::new(),
            error_report: None,
            firmware_version: None,
            received_at: None,
        }
    }

    /// Apply the disconnected > stale > stops precedence spec.md §4.5
    /// requires. `disconnected` and `now` let the caller drive this
    /// without the snapshot reaching back into the engine.
    pub fn with_error_report(mut self, disconnected: bool, now: Instant) -> Self {
        self.error_report = if disconnected {
            Some("disconnected from driveboard".to_string())
        } else if self.received_at.map(|t| now.duration_since(t) > STATUS_STALE_AFTER).unwrap_or(true) {
            Some("last status update is too old".to_string())
        } else if let Some((first, rest)) = self.stops.split_first() {
            Some(if rest.is_empty() {
                format!("stopped — {first}")
            } else {
                format!("stopped — {first} (and also {})", rest.join(", "))
            })
        } else {
            None
        };
        self
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.received_at.map(|t| now.duration_since(t) > STATUS_STALE_AFTER).unwrap_or(true)
    }

    /// Compact one-line rendering for a bare `?` G-code query (spec.md
    /// §4.6, §6). `?full` uses the boxed `Display` rendering instead;
    /// `GET /status` (the machine-readable sibling) uses JSON.
    pub fn short(&self) -> String {
        format!(
            "ready={} pos=({:.3},{:.3},{:.3}) job={:.1}% buf={:.1}%{}",
            self.ready,
            self.pos_x,
            self.pos_y,
            self.pos_z,
            self.job_percent,
            self.firmbuf_percent,
            self.error_report.as_deref().map(|e| format!(" error={e}")).unwrap_or_default(),
        )
    }
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "+{:-<46}+", "")?;
        writeln!(
            f,
            "| ready: {:<5} buf: {:>5.1}%  pos: ({:>8.3}, {:>8.3}, {:>8.3}) |",
            self.ready, self.firmbuf_percent, self.pos_x, self.pos_y, self.pos_z
        )?;
        writeln!(
            f,
            "| underruns: {:<6.0} stackclear: {:<6.0} delayed: {:<6.0}    |",
            self.underruns, self.stackclear, self.delayed_microsteps
        )?;
        writeln!(
            f,
            "| door_open: {:<5} chiller_off: {:<5}                     |",
            self.door_open, self.chiller_off
        )?;
        if let Some(ref err) = self.error_report {
            writeln!(f, "| error: {err:<38} |")?;
        }
        if !self.stops.is_empty() {
            writeln!(f, "| stops: {:<38} |", self.stops.join(","))?;
        }
        write!(f, "+{:-<46}+", "")
    }
}
