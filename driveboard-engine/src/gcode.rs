//! G-code Front-end (spec.md §4.6): turns one line of G-code text into
//! the parameters, command, and optional raster payload the protocol
//! engine submits to the firmware. Modal state (relative/absolute,
//! feedrate, seekrate, last target) persists across lines the way a
//! real G-code interpreter's does.

use crate::error::EngineError;
use crate::markers::{CmdMarker, ParamMarker};
use crate::pulse::intensity_to_pulse;

pub const DEFAULT_FEEDRATE: f64 = 6000.0;
pub const DEFAULT_SEEKRATE: f64 = 1500.0;
pub const RASTER_BYTES_MAX: usize = 60;

/// Returned by `!version`; identifies this engine to the operator, not
/// the firmware (that's `StatusSnapshot::firmware_version`).
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Which rendering of the status snapshot a bare `?` line asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusView {
    /// `?` — a short one-line summary.
    Short,
    /// `?full` — the full snapshot as JSON.
    Full,
    /// `?queue` — the compact `queue:<n>,<pct>,<n>` triple.
    Queue,
}

/// Out-of-band control lines (`!`, `~`, `!pause`, ...), handled before
/// any G-code tokenizing and independent of modal state. Per spec.md
/// §4.6 these are effective even while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCommand {
    Stop,
    Resume,
    Pause,
    Unpause,
    Version,
    Status(StatusView),
}

/// One fully-parsed line, ready for the engine to encode and submit.
/// Params are emitted in the order they must hit the wire: parameters
/// first, then the command, then any raster payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcodeLine {
    pub params: Vec<(ParamMarker, f64)>,
    pub command: Option<CmdMarker>,
    pub raster: Option<Vec<u8>>,
}

impl GcodeLine {
    fn is_empty(&self) -> bool {
        self.params.is_empty() && self.command.is_none() && self.raster.is_none()
    }
}

/// Which offset table `G10` is targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetTable {
    Table,
    Custom,
}

/// Modal G-code interpreter state, one instance per connection.
#[derive(Debug, Clone)]
pub struct GcodeFrontend {
    pub relative: bool,
    pub feedrate: f64,
    pub seekrate: f64,
    /// `None` once homing (`G30`) has invalidated the last known
    /// position, or before it has ever been set; a relative move that
    /// references an unknown axis is a parse error (spec.md §4.6).
    last_x: Option<f64>,
    last_y: Option<f64>,
    last_z: Option<f64>,
}

impl Default for GcodeFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl GcodeFrontend {
    pub fn new() -> Self {
        GcodeFrontend {
            relative: false,
            feedrate: DEFAULT_FEEDRATE,
            seekrate: DEFAULT_SEEKRATE,
            last_x: Some(0.0),
            last_y: Some(0.0),
            last_z: Some(0.0),
        }
    }

    /// Recognize `!`, `~`, `?`, and the pause/unpause/version aliases.
    /// Checked before [`GcodeFrontend::gcode_line`] and bypasses modal
    /// state entirely; these are effective even while disconnected.
    pub fn special_line(line: &str) -> Option<SpecialCommand> {
        match line.trim() {
            "!" | "!stop" => Some(SpecialCommand::Stop),
            "~" | "!resume" => Some(SpecialCommand::Resume),
            "!pause" => Some(SpecialCommand::Pause),
            "!unpause" => Some(SpecialCommand::Unpause),
            "!version" => Some(SpecialCommand::Version),
            "?" => Some(SpecialCommand::Status(StatusView::Short)),
            "?full" => Some(SpecialCommand::Status(StatusView::Full)),
            "?queue" => Some(SpecialCommand::Status(StatusView::Queue)),
            _ => None,
        }
    }

    /// Parse one line of G-code, updating modal state and returning the
    /// wire-ready parameters/command/raster payload. `Ok(None)` for
    /// blank or comment-only lines.
    pub fn gcode_line(&mut self, line: &str) -> Result<Option<GcodeLine>, EngineError> {
        let code = line.split(';').next().unwrap_or("").trim();
        if code.is_empty() {
            return Ok(None);
        }

        let (code, raster) = extract_raster(code)?;

        let tokens = tokenize(&code)?;
        let mut out = GcodeLine::default();
        out.raster = raster;
        let mut iter = tokens.into_iter().peekable();

        let Some((letter, value)) = iter.next() else {
            return Ok(None);
        };

        match letter {
            'G' => self.handle_g(value, &mut iter, &mut out)?,
            'M' => self.handle_m(value, &mut out)?,
            'S' => self.apply_intensity(value, &mut out)?,
            other => return Err(EngineError::InvalidGcode(format!("unrecognized command letter {other}"))),
        }

        if let Some((letter, _)) = iter.peek() {
            return Err(EngineError::InvalidGcode(format!("leftover token {letter} after command")));
        }

        if out.is_empty() { Ok(None) } else { Ok(Some(out)) }
    }

    fn handle_g(
        &mut self,
        value: f64,
        iter: &mut std::iter::Peekable<std::vec::IntoIter<(char, f64)>>,
        out: &mut GcodeLine,
    ) -> Result<(), EngineError> {
        let command = value.round() as i64;
        match command {
            7 => self.handle_g7(iter, out),
            0 | 1 => {
                let mut x = None;
                let mut y = None;
                let mut z = None;
                let mut f = None;
                let mut s = None;
                while let Some(&(letter, v)) = iter.peek() {
                    match letter {
                        'X' => {
                            x = Some(v);
                            iter.next();
                        }
                        'Y' => {
                            y = Some(v);
                            iter.next();
                        }
                        'Z' => {
                            z = Some(v);
                            iter.next();
                        }
                        'F' => {
                            f = Some(v);
                            iter.next();
                        }
                        'S' if command == 1 => {
                            s = Some(v);
                            iter.next();
                        }
                        _ => break,
                    }
                }

                if let Some(feed) = f {
                    if command == 0 {
                        self.seekrate = feed;
                    } else {
                        self.feedrate = feed;
                    }
                }

                let target_x = resolve_axis(x, self.last_x, self.relative)?;
                let target_y = resolve_axis(y, self.last_y, self.relative)?;
                let target_z = resolve_axis(z, self.last_z, self.relative)?;
                if x.is_some() {
                    if let Some(tx) = target_x {
                        out.params.push((ParamMarker::TargetX, tx));
                    }
                    self.last_x = target_x;
                }
                if y.is_some() {
                    if let Some(ty) = target_y {
                        out.params.push((ParamMarker::TargetY, ty));
                    }
                    self.last_y = target_y;
                }
                if z.is_some() {
                    if let Some(tz) = target_z {
                        out.params.push((ParamMarker::TargetZ, tz));
                    }
                    self.last_z = target_z;
                }
                let rate = if command == 0 { self.seekrate } else { self.feedrate };
                out.params.push((ParamMarker::Feedrate, rate));

                if let Some(intensity) = s {
                    self.apply_intensity(intensity, out)?;
                }

                out.command = Some(if command == 0 { CmdMarker::LineSeek } else { CmdMarker::LineBurn });
                Ok(())
            }
            90 => {
                self.relative = false;
                Ok(())
            }
            91 => {
                self.relative = true;
                Ok(())
            }
            10 => self.handle_g10(iter, out),
            54 => {
                out.command = Some(CmdMarker::SelOffsetTable);
                Ok(())
            }
            55 => {
                out.command = Some(CmdMarker::SelOffsetCustom);
                Ok(())
            }
            30 => {
                out.command = Some(CmdMarker::Homing);
                self.last_x = None;
                self.last_y = None;
                self.last_z = None;
                Ok(())
            }
            other => Err(EngineError::InvalidGcode(format!("unsupported G{other}"))),
        }
    }

    /// `G7`: raster move (spec.md §4.6). `V1` guards against a stale
    /// front-end talking to a firmware raster format it doesn't expect;
    /// the raster payload itself was already pulled off the line by
    /// [`extract_raster`] and lives in `out.raster`.
    fn handle_g7(
        &mut self,
        iter: &mut std::iter::Peekable<std::vec::IntoIter<(char, f64)>>,
        out: &mut GcodeLine,
    ) -> Result<(), EngineError> {
        let mut version = None;
        while let Some(&(letter, v)) = iter.peek() {
            match letter {
                'V' => {
                    version = Some(v.round() as i64);
                    iter.next();
                }
                _ => break,
            }
        }
        if version != Some(1) {
            return Err(EngineError::InvalidGcode("G7 requires V1".to_string()));
        }
        let raster = out
            .raster
            .as_ref()
            .ok_or_else(|| EngineError::InvalidGcode("G7 requires a D raster payload".to_string()))?;
        if raster.is_empty() {
            return Err(EngineError::InvalidGcode("G7 raster payload must not be empty".to_string()));
        }
        out.params.push((ParamMarker::RasterBytes, raster.len() as f64));
        out.command = Some(CmdMarker::LineRaster);
        Ok(())
    }

    fn handle_g10(
        &mut self,
        iter: &mut std::iter::Peekable<std::vec::IntoIter<(char, f64)>>,
        out: &mut GcodeLine,
    ) -> Result<(), EngineError> {
        let mut table = None;
        let mut l = None;
        while let Some(&(letter, v)) = iter.peek() {
            match letter {
                'P' => {
                    table = Some(match v as i64 {
                        0 => OffsetTable::Table,
                        1 => OffsetTable::Custom,
                        other => {
                            return Err(EngineError::InvalidGcode(format!(
                                "G10 requires P0 or P1, got P{other}"
                            )))
                        }
                    });
                    iter.next();
                }
                'L' => {
                    l = Some(v as i64);
                    iter.next();
                }
                _ => break,
            }
        }
        let table = table.ok_or_else(|| EngineError::InvalidGcode("G10 missing P word".to_string()))?;
        match l {
            Some(20) => {
                out.command = Some(match table {
                    OffsetTable::Table => CmdMarker::SetOffsetTable,
                    OffsetTable::Custom => CmdMarker::SetOffsetCustom,
                });
                Ok(())
            }
            Some(2) => {
                while let Some(&(letter, v)) = iter.peek() {
                    let marker = match (letter, table) {
                        ('X', OffsetTable::Table) => ParamMarker::OffTableX,
                        ('Y', OffsetTable::Table) => ParamMarker::OffTableY,
                        ('Z', OffsetTable::Table) => ParamMarker::OffTableZ,
                        ('X', OffsetTable::Custom) => ParamMarker::OffCustomX,
                        ('Y', OffsetTable::Custom) => ParamMarker::OffCustomY,
                        ('Z', OffsetTable::Custom) => ParamMarker::OffCustomZ,
                        _ => break,
                    };
                    out.params.push((marker, v));
                    iter.next();
                }
                Ok(())
            }
            _ => Err(EngineError::InvalidGcode("G10 missing or unsupported L word".to_string())),
        }
    }

    fn handle_m(&mut self, value: f64, out: &mut GcodeLine) -> Result<(), EngineError> {
        out.command = Some(match value.round() as i64 {
            80 => CmdMarker::AirEnable,
            81 => CmdMarker::AirDisable,
            82 => CmdMarker::Aux1Enable,
            83 => CmdMarker::Aux1Disable,
            84 => CmdMarker::Aux2Enable,
            85 => CmdMarker::Aux2Disable,
            other => return Err(EngineError::InvalidGcode(format!("unsupported M{other}"))),
        });
        Ok(())
    }

    fn apply_intensity(&mut self, value: f64, out: &mut GcodeLine) -> Result<(), EngineError> {
        if !(0.0..=255.0).contains(&value) {
            return Err(EngineError::IntensityOutOfRange(value as i64));
        }
        let (freq, duration) = intensity_to_pulse(value.round() as u8);
        out.params.push((ParamMarker::PulseFrequency, freq));
        out.params.push((ParamMarker::PulseDuration, duration as f64));
        Ok(())
    }
}

/// Resolve one axis's target for a G0/G1 move. `None` result means the
/// axis word was omitted and its last position is unknown (homing
/// invalidated it); a relative move that references such an axis is a
/// parse error rather than a silent no-op.
fn resolve_axis(value: Option<f64>, last: Option<f64>, relative: bool) -> Result<Option<f64>, EngineError> {
    match value {
        None => Ok(last),
        Some(v) if relative => {
            let last = last.ok_or_else(|| {
                EngineError::InvalidGcode(
                    "relative move references an axis with unknown position (after homing)".to_string(),
                )
            })?;
            Ok(Some(last + v))
        }
        Some(v) => Ok(Some(v)),
    }
}

/// Split a raster-bearing line on the ` D` marker, base64-decoding the
/// trailing payload. Returns the gcode-only prefix and the decoded
/// raster bytes, if present.
fn extract_raster(code: &str) -> Result<(String, Option<Vec<u8>>), EngineError> {
    let Some(idx) = code.find(" D") else {
        return Ok((code.to_string(), None));
    };
    let (head, tail) = code.split_at(idx);
    let encoded = &tail[2..];
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| EngineError::InvalidGcode(format!("bad raster payload: {e}")))?;
    if decoded.len() > RASTER_BYTES_MAX {
        return Err(EngineError::RasterTooLong { max: RASTER_BYTES_MAX, actual: decoded.len() });
    }
    Ok((head.trim().to_string(), Some(decoded)))
}

/// Tokenize `G1X10Y20F6000` into `[('G', 1.0), ('X', 10.0), ('Y', 20.0),
/// ('F', 6000.0)]`.
fn tokenize(code: &str) -> Result<Vec<(char, f64)>, EngineError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = code.chars().filter(|c| !c.is_whitespace()).collect();
    let mut i = 0;
    while i < chars.len() {
        let letter = chars[i];
        if !letter.is_ascii_alphabetic() {
            return Err(EngineError::InvalidGcode(format!("expected a letter, found {letter}")));
        }
        let letter = letter.to_ascii_uppercase();
        i += 1;
        let start = i;
        while i < chars.len() && !chars[i].is_ascii_alphabetic() {
            i += 1;
        }
        let number: String = chars[start..i].iter().collect();
        let value = if number.is_empty() {
            0.0
        } else {
            number.parse::<f64>().map_err(|_| EngineError::InvalidGcode(format!("bad number {number}")))?
        };
        tokens.push((letter, value));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_lines_recognized() {
        assert_eq!(GcodeFrontend::special_line("!"), Some(SpecialCommand::Stop));
        assert_eq!(GcodeFrontend::special_line("!stop"), Some(SpecialCommand::Stop));
        assert_eq!(GcodeFrontend::special_line("~"), Some(SpecialCommand::Resume));
        assert_eq!(GcodeFrontend::special_line("!pause"), Some(SpecialCommand::Pause));
        assert_eq!(GcodeFrontend::special_line("G1X10"), None);
    }

    #[test]
    fn blank_and_comment_only_lines_parse_to_none() {
        let mut fe = GcodeFrontend::new();
        assert_eq!(fe.gcode_line("").unwrap(), None);
        assert_eq!(fe.gcode_line("   ").unwrap(), None);
        assert_eq!(fe.gcode_line("; just a comment").unwrap(), None);
    }

    #[test]
    fn g1_move_emits_targets_feedrate_and_command() {
        let mut fe = GcodeFrontend::new();
        let line = fe.gcode_line("G1X10Y20F3000").unwrap().unwrap();
        assert_eq!(line.command, Some(CmdMarker::LineBurn));
        assert!(line.params.contains(&(ParamMarker::TargetX, 10.0)));
        assert!(line.params.contains(&(ParamMarker::TargetY, 20.0)));
        assert!(line.params.contains(&(ParamMarker::Feedrate, 3000.0)));
        assert_eq!(fe.feedrate, 3000.0);
    }

    #[test]
    fn g0_seek_uses_seekrate_not_feedrate() {
        let mut fe = GcodeFrontend::new();
        let line = fe.gcode_line("G0X5F1000").unwrap().unwrap();
        assert_eq!(line.command, Some(CmdMarker::LineSeek));
        assert!(line.params.contains(&(ParamMarker::Feedrate, 1000.0)));
        assert_eq!(fe.seekrate, 1000.0);
        assert_eq!(fe.feedrate, DEFAULT_FEEDRATE, "G0's F must not touch the burn feedrate");
    }

    #[test]
    fn relative_mode_accumulates_from_last_target() {
        let mut fe = GcodeFrontend::new();
        fe.gcode_line("G1X10Y10").unwrap();
        fe.gcode_line("G91").unwrap();
        let line = fe.gcode_line("G1X5Y5").unwrap().unwrap();
        assert!(line.params.contains(&(ParamMarker::TargetX, 15.0)));
        assert!(line.params.contains(&(ParamMarker::TargetY, 15.0)));
    }

    #[test]
    fn homing_invalidates_modal_position_and_blocks_relative_moves() {
        let mut fe = GcodeFrontend::new();
        fe.gcode_line("G1X10Y10").unwrap();
        fe.gcode_line("G30").unwrap();
        fe.gcode_line("G91").unwrap();
        let err = fe.gcode_line("G1X5").unwrap_err();
        assert!(matches!(err, EngineError::InvalidGcode(_)));
    }

    #[test]
    fn homing_still_allows_absolute_moves_afterward() {
        let mut fe = GcodeFrontend::new();
        fe.gcode_line("G1X10Y10").unwrap();
        fe.gcode_line("G30").unwrap();
        let line = fe.gcode_line("G1X5").unwrap().unwrap();
        assert!(line.params.contains(&(ParamMarker::TargetX, 5.0)));
    }

    #[test]
    fn version_and_status_special_lines_recognized() {
        assert_eq!(GcodeFrontend::special_line("!version"), Some(SpecialCommand::Version));
        assert_eq!(GcodeFrontend::special_line("?"), Some(SpecialCommand::Status(StatusView::Short)));
        assert_eq!(GcodeFrontend::special_line("?full"), Some(SpecialCommand::Status(StatusView::Full)));
        assert_eq!(GcodeFrontend::special_line("?queue"), Some(SpecialCommand::Status(StatusView::Queue)));
    }

    #[test]
    fn bare_intensity_line_emits_pulse_params_with_no_command() {
        let mut fe = GcodeFrontend::new();
        let line = fe.gcode_line("S128").unwrap().unwrap();
        assert!(line.command.is_none());
        assert_eq!(line.params.len(), 2);
    }

    #[test]
    fn intensity_out_of_range_is_rejected() {
        let mut fe = GcodeFrontend::new();
        let err = fe.gcode_line("S300").unwrap_err();
        assert!(matches!(err, EngineError::IntensityOutOfRange(300)));
    }

    #[test]
    fn g10_l20_sets_offset_table_from_current_position() {
        let mut fe = GcodeFrontend::new();
        let line = fe.gcode_line("G10P0L20").unwrap().unwrap();
        assert_eq!(line.command, Some(CmdMarker::SetOffsetTable));
    }

    #[test]
    fn g10_l2_emits_named_offset_params() {
        let mut fe = GcodeFrontend::new();
        let line = fe.gcode_line("G10P1L2X1Y2Z3").unwrap().unwrap();
        assert!(line.params.contains(&(ParamMarker::OffCustomX, 1.0)));
        assert!(line.params.contains(&(ParamMarker::OffCustomY, 2.0)));
        assert!(line.params.contains(&(ParamMarker::OffCustomZ, 3.0)));
    }

    #[test]
    fn g10_rejects_p_values_other_than_zero_or_one() {
        let mut fe = GcodeFrontend::new();
        let err = fe.gcode_line("G10P2L2X0").unwrap_err();
        assert!(matches!(err, EngineError::InvalidGcode(_)));
    }

    #[test]
    fn g54_g55_select_offset_tables() {
        let mut fe = GcodeFrontend::new();
        assert_eq!(fe.gcode_line("G54").unwrap().unwrap().command, Some(CmdMarker::SelOffsetTable));
        assert_eq!(fe.gcode_line("G55").unwrap().unwrap().command, Some(CmdMarker::SelOffsetCustom));
    }

    #[test]
    fn m_codes_map_to_aux_commands() {
        let mut fe = GcodeFrontend::new();
        assert_eq!(fe.gcode_line("M80").unwrap().unwrap().command, Some(CmdMarker::AirEnable));
        assert_eq!(fe.gcode_line("M85").unwrap().unwrap().command, Some(CmdMarker::Aux2Disable));
    }

    #[test]
    fn unsupported_command_is_an_error() {
        let mut fe = GcodeFrontend::new();
        assert!(fe.gcode_line("G92X0").is_err(), "G92 is not in the supported command table");
        assert!(fe.gcode_line("M200").is_err());
    }

    #[test]
    fn raster_line_decodes_base64_payload() {
        let mut fe = GcodeFrontend::new();
        use base64::Engine as _;
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let line = fe.gcode_line(&format!("G7V1 D{payload}")).unwrap().unwrap();
        assert_eq!(line.command, Some(CmdMarker::LineRaster));
        assert_eq!(line.raster, Some(vec![1, 2, 3]));
        assert!(line.params.contains(&(ParamMarker::RasterBytes, 3.0)));
    }

    #[test]
    fn raster_move_without_v1_is_rejected() {
        let mut fe = GcodeFrontend::new();
        use base64::Engine as _;
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(fe.gcode_line(&format!("G7 D{payload}")).is_err());
    }

    #[test]
    fn oversized_raster_payload_is_rejected() {
        let mut fe = GcodeFrontend::new();
        use base64::Engine as _;
        let payload = base64::engine::general_purpose::STANDARD.encode(vec![0u8; RASTER_BYTES_MAX + 1]);
        let err = fe.gcode_line(&format!("G7V1 D{payload}")).unwrap_err();
        assert!(matches!(err, EngineError::RasterTooLong { .. }));
    }
}
