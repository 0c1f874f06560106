use driveboard_engine::codec::encode_parameter;
use driveboard_engine::engine::{Engine, EngineEvent};
use std::time::Instant;

/// Feed a whole byte slice through the engine, collecting every event
/// produced along the way (flattened across bytes, in order).
pub fn feed_all(engine: &mut Engine, bytes: &[u8]) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    for &b in bytes {
        out.extend(engine.on_byte_received(b, Instant::now()));
    }
    out
}

/// Build the wire bytes for one inbound parameter: 4 accumulator bytes
/// followed by the marker.
pub fn param_bytes(marker: u8, value: f64) -> Vec<u8> {
    let mut out = encode_parameter(value).to_vec();
    out.push(marker);
    out
}

/// Drive a freshly-created engine through a successful connection
/// handshake (port opened, correct greeting value received).
pub fn connected_engine() -> Engine {
    let mut engine = Engine::new();
    engine.begin_connecting();
    engine.port_opened();
    let bytes = param_bytes(driveboard_engine::markers::InfoValue::StartupGreeting.into(), 123.456);
    feed_all(&mut engine, &bytes);
    engine
}
