use thiserror::Error;

/// Errors surfaced by the driveboard engine: codec framing, protocol
/// sequencing, and the serial transport underneath it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("serial port not found: {0}")]
    PortNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("malformed gcode line: {0}")]
    InvalidGcode(String),

    #[error("firmware reported stop condition(s): {0:?}")]
    FirmwareStop(Vec<String>),

    #[error("not connected")]
    NotConnected,

    #[error("raster payload exceeds {max} bytes ({actual} given)")]
    RasterTooLong { max: usize, actual: usize },

    #[error("intensity {0} out of range 0-255")]
    IntensityOutOfRange(i64),
}
