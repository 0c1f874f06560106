//! The driveboard marker table.
//!
//! Every byte that crosses the wire is one of a small set of named markers,
//! partitioned by direction and by whether it carries trailing parameter
//! data. In the original firmware these are `#define`s in a shared C
//! header (`protocol.h`) that both the firmware and the host import; here
//! they are a committed enumeration (see DESIGN.md for why we don't parse
//! a header at build time) checked once, at process start, for the
//! uniqueness invariant spec.md §3 requires.

use num_enum::{FromPrimitive, IntoPrimitive};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Outbound control-character and line commands (`CMD_*`).
///
/// Values below 32 are flow-control bytes handled by the firmware's
/// receive interrupt and are never subject to buffer-credit accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum CmdMarker {
    /// Emitted by the firmware as an acknowledgment; also a line in the
    /// outbound marker table since it shares the `CMD_` prefix convention.
    ChunkProcessed = 1,
    ResetProtocol = 2,
    Superstatus = 3,
    Status = 4,
    Stop = 5,
    Resume = 6,

    LineSeek = 46,
    LineBurn = 47,
    LineRaster = 48,
    RefAbsolute = 49,
    RefRelative = 50,
    AirEnable = 51,
    AirDisable = 52,
    Aux1Enable = 53,
    Aux1Disable = 54,
    Aux2Enable = 55,
    Aux2Disable = 56,
    SetOffsetTable = 57,
    SetOffsetCustom = 58,
    SelOffsetTable = 59,
    SelOffsetCustom = 60,
    Homing = 61,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl CmdMarker {
    /// Control characters bypass the firmbuf-queue and credit accounting;
    /// everything else is subject to backpressure.
    pub fn is_control(self) -> bool {
        u8::from(self) < 32
    }

    pub fn name(self) -> &'static str {
        match self {
            CmdMarker::ChunkProcessed => "CMD_CHUNK_PROCESSED",
            CmdMarker::ResetProtocol => "CMD_RESET_PROTOCOL",
            CmdMarker::Superstatus => "CMD_SUPERSTATUS",
            CmdMarker::Status => "CMD_STATUS",
            CmdMarker::Stop => "CMD_STOP",
            CmdMarker::Resume => "CMD_RESUME",
            CmdMarker::LineSeek => "CMD_LINE_SEEK",
            CmdMarker::LineBurn => "CMD_LINE_BURN",
            CmdMarker::LineRaster => "CMD_LINE_RASTER",
            CmdMarker::RefAbsolute => "CMD_REF_ABSOLUTE",
            CmdMarker::RefRelative => "CMD_REF_RELATIVE",
            CmdMarker::AirEnable => "CMD_AIR_ENABLE",
            CmdMarker::AirDisable => "CMD_AIR_DISABLE",
            CmdMarker::Aux1Enable => "CMD_AUX1_ENABLE",
            CmdMarker::Aux1Disable => "CMD_AUX1_DISABLE",
            CmdMarker::Aux2Enable => "CMD_AUX2_ENABLE",
            CmdMarker::Aux2Disable => "CMD_AUX2_DISABLE",
            CmdMarker::SetOffsetTable => "CMD_SET_OFFSET_TABLE",
            CmdMarker::SetOffsetCustom => "CMD_SET_OFFSET_CUSTOM",
            CmdMarker::SelOffsetTable => "CMD_SEL_OFFSET_TABLE",
            CmdMarker::SelOffsetCustom => "CMD_SEL_OFFSET_CUSTOM",
            CmdMarker::Homing => "CMD_HOMING",
            CmdMarker::Unknown(_) => "CMD_UNKNOWN",
        }
    }
}

/// Outbound parameter markers (`PARAM_*`). Each always arrives on the wire
/// preceded by four 7-bit data bytes encoding a fixed-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ParamMarker {
    TargetX = 105,
    TargetY = 106,
    TargetZ = 107,
    Feedrate = 108,
    RasterBytes = 109,
    PulseFrequency = 110,
    PulseDuration = 111,
    OffTableX = 112,
    OffTableY = 113,
    OffTableZ = 114,
    OffCustomX = 115,
    OffCustomY = 116,
    OffCustomZ = 117,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl ParamMarker {
    pub fn name(self) -> &'static str {
        match self {
            ParamMarker::TargetX => "PARAM_TARGET_X",
            ParamMarker::TargetY => "PARAM_TARGET_Y",
            ParamMarker::TargetZ => "PARAM_TARGET_Z",
            ParamMarker::Feedrate => "PARAM_FEEDRATE",
            ParamMarker::RasterBytes => "PARAM_RASTER_BYTES",
            ParamMarker::PulseFrequency => "PARAM_PULSE_FREQUENCY",
            ParamMarker::PulseDuration => "PARAM_PULSE_DURATION",
            ParamMarker::OffTableX => "PARAM_OFFTABLE_X",
            ParamMarker::OffTableY => "PARAM_OFFTABLE_Y",
            ParamMarker::OffTableZ => "PARAM_OFFTABLE_Z",
            ParamMarker::OffCustomX => "PARAM_OFFCUSTOM_X",
            ParamMarker::OffCustomY => "PARAM_OFFCUSTOM_Y",
            ParamMarker::OffCustomZ => "PARAM_OFFCUSTOM_Z",
            ParamMarker::Unknown(_) => "PARAM_UNKNOWN",
        }
    }
}

/// Inbound boolean info markers (`INFO_*`), set without trailing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum InfoFlag {
    IdleYes = 43,
    DoorOpen = 44,
    ChillerOff = 45,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl InfoFlag {
    pub fn name(self) -> &'static str {
        match self {
            InfoFlag::IdleYes => "INFO_IDLE_YES",
            InfoFlag::DoorOpen => "INFO_DOOR_OPEN",
            InfoFlag::ChillerOff => "INFO_CHILLER_OFF",
            InfoFlag::Unknown(_) => "INFO_UNKNOWN",
        }
    }
}

/// Inbound `INFO_*` markers that carry a fixed-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum InfoValue {
    StartupGreeting = 97,
    Version = 98,
    PosX = 99,
    PosY = 100,
    PosZ = 101,
    BufferUnderrun = 102,
    StackClearance = 103,
    DelayedMicrosteps = 104,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl InfoValue {
    pub fn name(self) -> &'static str {
        match self {
            InfoValue::StartupGreeting => "INFO_STARTUP_GREETING",
            InfoValue::Version => "INFO_VERSION",
            InfoValue::PosX => "INFO_POS_X",
            InfoValue::PosY => "INFO_POS_Y",
            InfoValue::PosZ => "INFO_POS_Z",
            InfoValue::BufferUnderrun => "INFO_BUFFER_UNDERRUN",
            InfoValue::StackClearance => "INFO_STACK_CLEARANCE",
            InfoValue::DelayedMicrosteps => "INFO_DELAYED_MICROSTEPS",
            InfoValue::Unknown(_) => "INFO_UNKNOWN",
        }
    }
}

/// Inbound stop-error markers (`STOPERROR_*`). `Ok` is the all-clear value
/// and is never surfaced in [`crate::status::StatusSnapshot::stops`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum StopError {
    Ok = 32,
    SerialStopRequest = 33,
    LimitHitX1 = 34,
    LimitHitX2 = 35,
    LimitHitY1 = 36,
    LimitHitY2 = 37,
    LimitHitZ1 = 38,
    LimitHitZ2 = 39,
    RxBufferOverflow = 40,
    TransmissionError = 41,
    OverTemperature = 42,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl StopError {
    pub fn name(self) -> &'static str {
        match self {
            StopError::Ok => "STOPERROR_OK",
            StopError::SerialStopRequest => "STOPERROR_SERIAL_STOP_REQUEST",
            StopError::LimitHitX1 => "STOPERROR_LIMIT_HIT_X1",
            StopError::LimitHitX2 => "STOPERROR_LIMIT_HIT_X2",
            StopError::LimitHitY1 => "STOPERROR_LIMIT_HIT_Y1",
            StopError::LimitHitY2 => "STOPERROR_LIMIT_HIT_Y2",
            StopError::LimitHitZ1 => "STOPERROR_LIMIT_HIT_Z1",
            StopError::LimitHitZ2 => "STOPERROR_LIMIT_HIT_Z2",
            StopError::RxBufferOverflow => "STOPERROR_RX_BUFFER_OVERFLOW",
            StopError::TransmissionError => "STOPERROR_TRANSMISSION_ERROR",
            StopError::OverTemperature => "STOPERROR_OVER_TEMPERATURE",
            StopError::Unknown(_) => "STOPERROR_UNKNOWN",
        }
    }

    /// Lowercase reason string as surfaced in `StatusSnapshot::stops`,
    /// e.g. `limit_hit_x1`.
    pub fn reason(self) -> String {
        self.name()
            .strip_prefix("STOPERROR_")
            .unwrap_or(self.name())
            .to_lowercase()
    }
}

/// Inbound flow markers outside the two hard-coded ones (`CMD_CHUNK_PROCESSED`,
/// `STATUS_END`) that the codec special-cases directly; kept here only so
/// `STATUS_END`'s code has a name in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum StatusMarker {
    End = 7,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl StatusMarker {
    pub fn name(self) -> &'static str {
        match self {
            StatusMarker::End => "STATUS_END",
            StatusMarker::Unknown(_) => "STATUS_UNKNOWN",
        }
    }
}

/// All known (code, name) pairs across every direction, for the uniqueness
/// invariant and for diagnostics when an unrecognized byte is observed.
fn registry() -> &'static Vec<(u8, &'static str)> {
    static REGISTRY: OnceLock<Vec<(u8, &'static str)>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        use CmdMarker::*;
        use ParamMarker::*;
        let cmds = [
            ChunkProcessed,
            ResetProtocol,
            Superstatus,
            Status,
            Stop,
            Resume,
            LineSeek,
            LineBurn,
            LineRaster,
            RefAbsolute,
            RefRelative,
            AirEnable,
            AirDisable,
            Aux1Enable,
            Aux1Disable,
            Aux2Enable,
            Aux2Disable,
            SetOffsetTable,
            SetOffsetCustom,
            SelOffsetTable,
            SelOffsetCustom,
            Homing,
        ]
        .into_iter()
        .map(|m| (u8::from(m), m.name()));

        let params = [
            TargetX,
            TargetY,
            TargetZ,
            Feedrate,
            RasterBytes,
            PulseFrequency,
            PulseDuration,
            OffTableX,
            OffTableY,
            OffTableZ,
            OffCustomX,
            OffCustomY,
            OffCustomZ,
        ]
        .into_iter()
        .map(|m| (u8::from(m), m.name()));

        let info_flags = [InfoFlag::IdleYes, InfoFlag::DoorOpen, InfoFlag::ChillerOff]
            .into_iter()
            .map(|m| (u8::from(m), m.name()));

        let info_values = [
            InfoValue::StartupGreeting,
            InfoValue::Version,
            InfoValue::PosX,
            InfoValue::PosY,
            InfoValue::PosZ,
            InfoValue::BufferUnderrun,
            InfoValue::StackClearance,
            InfoValue::DelayedMicrosteps,
        ]
        .into_iter()
        .map(|m| (u8::from(m), m.name()));

        let stops = [
            StopError::Ok,
            StopError::SerialStopRequest,
            StopError::LimitHitX1,
            StopError::LimitHitX2,
            StopError::LimitHitY1,
            StopError::LimitHitY2,
            StopError::LimitHitZ1,
            StopError::LimitHitZ2,
            StopError::RxBufferOverflow,
            StopError::TransmissionError,
            StopError::OverTemperature,
        ]
        .into_iter()
        .map(|m| (u8::from(m), m.name()));

        let status = [StatusMarker::End].into_iter().map(|m| (u8::from(m), m.name()));

        cmds.chain(params)
            .chain(info_flags)
            .chain(info_values)
            .chain(stops)
            .chain(status)
            .collect()
    })
}

/// Verify the spec.md §3 invariant: every marker code is unique across both
/// directions, and no marker has code 0. Called from tests, and cheap
/// enough to call from a debug assertion at startup.
pub fn assert_marker_table_invariants() {
    let reg = registry();
    let mut seen = HashSet::new();
    for &(code, name) in reg {
        assert_ne!(code, 0, "marker {name} has reserved code 0");
        assert!(seen.insert(code), "marker code {code} is reused (first clash at {name})");
    }
}
