//! Host-side protocol engine for the driveboard laser-cutter motion
//! controller: wire codec, buffer-credit tracking, connection lifecycle,
//! status model, and G-code front-end.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod gcode;
pub mod link;
pub mod markers;
pub mod pulse;
pub mod status;

pub use config::EngineConfig;
pub use driver::{DriveboardHandle, DriverSnapshot};
pub use engine::{ConnectionState, Engine, EngineEvent};
pub use error::EngineError;
pub use gcode::{GcodeFrontend, GcodeLine, SpecialCommand};
pub use status::StatusSnapshot;
