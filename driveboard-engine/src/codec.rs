//! The protocol codec (spec.md §4.1): classifies each inbound byte by
//! range and reassembles the 4-byte fixed-point parameter encoding the
//! firmware uses for `INFO_*` values.
//!
//! Byte ranges, exactly as the firmware's UART receive handler treats
//! them:
//!   - `< 32`            flow-control (chunk-processed, status-end)
//!   - `32..91`          flag markers (`STOPERROR_*`, `INFO_IDLE_YES`, ...)
//!   - `96..123`         parameter markers, consuming the 4 accumulated
//!                       data bytes that preceded them
//!   - `> 127`           raw data byte, pushed onto the parameter
//!                       accumulator

use crate::markers::{CmdMarker, InfoFlag, InfoValue, StatusMarker, StopError};
use std::collections::VecDeque;

/// Accumulated data bytes are always exactly 4; this is the 28-bit
/// fixed-point encoding's width.
const PARAM_BYTES: usize = 4;
const HISTORY_LEN: usize = 80;

/// Bias applied to the 28-bit reconstructed integer before dividing by
/// 1000 to recover the original signed decimal value. `2^27`.
const PARAM_BIAS: i64 = 134_217_728;
const PARAM_SCALE: f64 = 1000.0;

/// One decoded event from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    ChunkProcessed,
    StatusEnd,
    StopError(StopError),
    InfoFlag(InfoFlag),
    Parameter(InfoValue, f64),
    /// A flow-control byte with no recognized meaning; not fatal.
    UnknownFlow(u8),
    /// A framing error: either a parameter marker arrived without exactly
    /// 4 preceding data bytes (`marker` is `Some`), or a 5th data byte
    /// arrived before any marker did, forcing the oldest queued byte out
    /// of the accumulator (`marker` is `None`, `accumulated` holds just
    /// the discarded byte).
    FramingError { marker: Option<u8>, accumulated: Vec<u8> },
}

/// Stateful byte-range classifier. One instance per serial connection.
pub struct Codec {
    pending_data: Vec<u8>,
    history: VecDeque<u8>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Codec { pending_data: Vec::with_capacity(PARAM_BYTES), history: VecDeque::with_capacity(HISTORY_LEN) }
    }

    /// Last (up to) 80 received bytes, oldest first — used for framing
    /// error diagnostics, not for parsing.
    pub fn history(&self) -> Vec<u8> {
        self.history.iter().copied().collect()
    }

    fn record(&mut self, byte: u8) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(byte);
    }

    /// Feed one received byte, returning an event if the byte completed
    /// one (flow bytes and parameter markers always do; raw data bytes
    /// accumulate silently and return `None`).
    pub fn feed(&mut self, byte: u8) -> Option<CodecEvent> {
        self.record(byte);

        if byte > 127 {
            if self.pending_data.len() == PARAM_BYTES {
                // Accumulator already full and no marker arrived to claim
                // it: the oldest byte is stale, so it slides out (spec.md
                // §4.1) and the overflow itself is a framing error.
                let discarded = self.pending_data.remove(0);
                self.pending_data.push(byte);
                return Some(CodecEvent::FramingError { marker: None, accumulated: vec![discarded] });
            }
            self.pending_data.push(byte);
            return None;
        }

        if byte < 32 {
            return Some(match CmdMarker::from(byte) {
                CmdMarker::ChunkProcessed => CodecEvent::ChunkProcessed,
                _ if StatusMarker::from(byte) == StatusMarker::End => CodecEvent::StatusEnd,
                _ => CodecEvent::UnknownFlow(byte),
            });
        }

        if (32..91).contains(&byte) {
            let stop = StopError::from(byte);
            if !matches!(stop, StopError::Unknown(_)) {
                return Some(CodecEvent::StopError(stop));
            }
            let flag = InfoFlag::from(byte);
            return Some(CodecEvent::InfoFlag(flag));
        }

        if (96..123).contains(&byte) {
            let accumulated = std::mem::take(&mut self.pending_data);
            if accumulated.len() != PARAM_BYTES {
                return Some(CodecEvent::FramingError { marker: Some(byte), accumulated });
            }
            let value = decode_parameter(&accumulated);
            return Some(CodecEvent::Parameter(InfoValue::from(byte), value));
        }

        // 91..96 and 123..128 are gaps the firmware must never emit
        // (spec.md §4.1): treat as a framing error, not a merely-unknown
        // flow byte, so it is logged with the accumulator state rather
        // than silently dropped.
        Some(CodecEvent::FramingError { marker: Some(byte), accumulated: std::mem::take(&mut self.pending_data) })
    }
}

/// Decode the 4-byte, 28-bit fixed-point accumulator into its signed
/// decimal value. Inverse of [`encode_parameter`].
fn decode_parameter(bytes: &[u8]) -> f64 {
    debug_assert_eq!(bytes.len(), PARAM_BYTES);
    let num = ((bytes[0] as i64 & 0x7F) << 21)
        | ((bytes[1] as i64 & 0x7F) << 14)
        | ((bytes[2] as i64 & 0x7F) << 7)
        | (bytes[3] as i64 & 0x7F);
    (num - PARAM_BIAS) as f64 / PARAM_SCALE
}

/// Encode a decimal value (3 decimal places of precision) into the
/// 4-byte accumulator the firmware expects before a parameter marker.
pub fn encode_parameter(value: f64) -> [u8; PARAM_BYTES] {
    let num = ((value * PARAM_SCALE).round() as i64 + PARAM_BIAS).clamp(0, (1i64 << 28) - 1);
    [
        ((num >> 21) & 0x7F) as u8 | 0x80,
        ((num >> 14) & 0x7F) as u8 | 0x80,
        ((num >> 7) & 0x7F) as u8 | 0x80,
        (num & 0x7F) as u8 | 0x80,
    ]
}

/// Build the full wire sequence for sending a parameter: 4 data bytes
/// then the marker. Caller is responsible for the double-byte
/// transmission discipline (spec.md §9) at the write layer.
pub fn encode_param_marker(marker: u8, value: f64) -> Vec<u8> {
    let mut out = encode_parameter(value).to_vec();
    out.push(marker);
    out
}

/// Encode a bare command marker (no trailing data).
pub fn encode_command(marker: u8) -> Vec<u8> {
    vec![marker]
}

/// Encode a raster payload: each pulse-duration sample is clipped to the
/// valid `0..=127` tick range, then sent as `v | 0x80` so it is
/// distinguishable from marker bytes, which are always `< 128`
/// (spec.md §3, §8).
pub fn encode_raster(samples: &[u8]) -> Vec<u8> {
    samples.iter().map(|v| v.min(127) | 0x80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_round_trips_through_encode_and_decode() {
        for v in [-100.0, 0.0, 12.345, 1000.0, -1000.5] {
            let encoded = encode_parameter(v);
            let decoded = decode_parameter(&encoded);
            assert!((decoded - v).abs() < 1e-6, "{v} round-tripped to {decoded}");
        }
    }

    #[test]
    fn data_bytes_accumulate_until_marker_seen() {
        let mut codec = Codec::new();
        assert_eq!(codec.feed(0b1000_0001), None);
        assert_eq!(codec.feed(0b1000_0010), None);
        assert_eq!(codec.feed(0b1000_0011), None);
        assert_eq!(codec.feed(0b1000_0100), None);
        let event = codec.feed(InfoValue::PosX.into());
        match event {
            Some(CodecEvent::Parameter(InfoValue::PosX, _)) => {}
            other => panic!("expected Parameter(PosX, _), got {other:?}"),
        }
    }

    #[test]
    fn chunk_processed_byte_classified_as_flow() {
        let mut codec = Codec::new();
        let event = codec.feed(CmdMarker::ChunkProcessed.into());
        assert_eq!(event, Some(CodecEvent::ChunkProcessed));
    }

    #[test]
    fn status_end_byte_classified_as_flow() {
        let mut codec = Codec::new();
        let event = codec.feed(StatusMarker::End.into());
        assert_eq!(event, Some(CodecEvent::StatusEnd));
    }

    #[test]
    fn stop_error_byte_classified_in_flag_range() {
        let mut codec = Codec::new();
        let event = codec.feed(StopError::LimitHitX1.into());
        assert_eq!(event, Some(CodecEvent::StopError(StopError::LimitHitX1)));
    }

    #[test]
    fn parameter_marker_without_four_bytes_is_a_framing_error() {
        let mut codec = Codec::new();
        codec.feed(0b1000_0001);
        let event = codec.feed(InfoValue::PosX.into());
        match event {
            Some(CodecEvent::FramingError { marker, accumulated }) => {
                assert_eq!(marker, Some(u8::from(InfoValue::PosX)));
                assert_eq!(accumulated.len(), 1);
            }
            other => panic!("expected FramingError, got {other:?}"),
        }
    }

    #[test]
    fn fifth_data_byte_before_a_marker_discards_the_oldest_and_reports_framing_error() {
        let mut codec = Codec::new();
        for b in [0b1000_0001u8, 0b1000_0010, 0b1000_0011, 0b1000_0100] {
            assert_eq!(codec.feed(b), None);
        }
        let event = codec.feed(0b1000_0101);
        match event {
            Some(CodecEvent::FramingError { marker: None, accumulated }) => {
                assert_eq!(accumulated, vec![0b1000_0001]);
            }
            other => panic!("expected overflow FramingError, got {other:?}"),
        }
        // The accumulator still holds exactly 4 bytes (the sliding window),
        // so a marker byte now decodes the *new* window, not a stale one.
        let event = codec.feed(InfoValue::PosX.into());
        assert!(matches!(event, Some(CodecEvent::Parameter(InfoValue::PosX, _))));
    }

    #[test]
    fn raster_samples_get_high_bit_set() {
        let encoded = encode_raster(&[0, 1, 127, 255]);
        assert_eq!(encoded, vec![0x80, 0x81, 0xFF, 0xFF]);
    }

    #[test]
    fn raster_samples_above_127_are_clipped_before_encoding() {
        // 200 | 0x80 directly would be 0xC8, which is wrong: only values
        // 0-127 are valid pulse durations, so 200 must clip to 127 first.
        let encoded = encode_raster(&[200]);
        assert_eq!(encoded, vec![127 | 0x80]);
    }

    #[test]
    fn history_ring_buffer_caps_at_eighty_bytes() {
        let mut codec = Codec::new();
        for i in 0..200u32 {
            codec.feed((i % 32) as u8);
        }
        assert_eq!(codec.history().len(), HISTORY_LEN);
    }
}
