mod common;

use common::{connected_engine, feed_all, param_bytes};
use driveboard_engine::buffer::{CHUNK, FIRMBUF_CAPACITY};
use driveboard_engine::codec::{encode_command, encode_raster};
use driveboard_engine::engine::{ConnectionState, Engine, EngineEvent};
use driveboard_engine::gcode::{GcodeFrontend, SpecialCommand};
use driveboard_engine::markers::{CmdMarker, InfoValue, StatusMarker, StopError};

#[test]
fn fresh_connection_reaches_running_on_correct_greeting() {
    let engine = connected_engine();
    assert_eq!(engine.state(), ConnectionState::Running);
}

#[test]
fn status_cycle_assembles_snapshot_with_position_and_clears_pending() {
    let mut engine = connected_engine();
    let mut bytes = Vec::new();
    bytes.extend(param_bytes(InfoValue::PosX.into(), 12.5));
    bytes.extend(param_bytes(InfoValue::PosY.into(), -3.0));
    bytes.push(StatusMarker::End.into());

    let events = feed_all(&mut engine, &bytes);
    let snapshot = events
        .into_iter()
        .find_map(|e| match e {
            EngineEvent::StatusUpdated(s) => Some(s),
            _ => None,
        })
        .expect("expected a StatusUpdated event");

    assert_eq!(snapshot.pos_x, 12.5);
    assert_eq!(snapshot.pos_y, -3.0);
    assert!(snapshot.stops.is_empty());
}

#[test]
fn stop_error_during_status_cycle_moves_engine_to_stopped() {
    let mut engine = connected_engine();
    let mut bytes = Vec::new();
    bytes.push(StopError::LimitHitY1.into());
    bytes.push(StatusMarker::End.into());

    let events = feed_all(&mut engine, &bytes);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Stopped(stops) if stops == &vec!["limit_hit_y1".to_string()])));
    assert_eq!(engine.state(), ConnectionState::Stopped);
}

#[test]
fn backpressure_holds_bytes_until_chunk_processed_frees_credit() {
    let mut engine = connected_engine();
    let job: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8 + 1).collect();
    let first = engine.submit(&job);
    assert!(first.len() <= FIRMBUF_CAPACITY);
    assert!(first.len() < job.len(), "a 300-byte job must not fully clear on the first submit");

    let events = feed_all(&mut engine, &[CmdMarker::ChunkProcessed.into()]);
    let released: usize = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::WriteBytes(b) => Some(b.len()),
            _ => None,
        })
        .sum();
    assert!(released > 0 && released <= CHUNK);
}

#[test]
fn greeting_timeout_without_any_bytes_disconnects() {
    let mut engine = Engine::new();
    engine.begin_connecting();
    engine.port_opened();
    let event = engine.on_greeting_timeout();
    assert!(matches!(event, EngineEvent::Disconnected { .. }));
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

#[test]
fn request_stop_only_writes_cmd_stop_and_waits_for_firmware_confirmation() {
    let mut engine = connected_engine();
    let stop_bytes = engine.request_stop();
    assert_eq!(stop_bytes, vec![u8::from(CmdMarker::Stop)]);
    // CMD_STOP alone does not move the engine to Stopped; only a
    // committed status frame carrying a STOPERROR_* does (spec.md §4.4).
    assert_eq!(engine.state(), ConnectionState::Running);
}

#[test]
fn firmware_confirmed_stop_clears_queued_bytes_so_a_later_resume_cannot_replay_them() {
    let mut engine = connected_engine();
    // Saturate the credit wall so some of this job is still queued
    // host-side, not yet on the wire, when the stop is requested.
    let job: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8 + 1).collect();
    engine.submit(&job);
    assert!(engine.job_percent() < 100.0, "some bytes must still be queued behind the credit wall");

    engine.request_stop();
    assert_eq!(engine.state(), ConnectionState::Running);

    let events = feed_all(&mut engine, &[StopError::LimitHitX1.into(), StatusMarker::End.into()]);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Stopped(stops) if stops == &vec!["limit_hit_x1".to_string()])));
    assert_eq!(engine.state(), ConnectionState::Stopped);
    assert_eq!(engine.job_percent(), 100.0, "stop must clear the host queue, leaving nothing to replay");

    let resume_bytes = engine.request_resume();
    assert_eq!(engine.state(), ConnectionState::Resuming);
    assert_eq!(resume_bytes, vec![u8::from(CmdMarker::Resume)]);
}

#[test]
fn pause_and_unpause_are_local_and_emit_no_wire_bytes() {
    let mut engine = connected_engine();
    assert_eq!(GcodeFrontend::special_line("!pause"), Some(SpecialCommand::Pause));
    engine.pause();
    assert_eq!(engine.state(), ConnectionState::Paused);
    engine.unpause();
    assert_eq!(engine.state(), ConnectionState::Running);
}

#[test]
fn full_gcode_line_encodes_to_params_then_command_then_raster() {
    let mut frontend = GcodeFrontend::new();
    let line = frontend.gcode_line("G1X10Y20F3000").unwrap().unwrap();
    assert!(line.command.is_some());

    let mut wire = Vec::new();
    for (marker, value) in &line.params {
        wire.extend(driveboard_engine::codec::encode_param_marker((*marker).into(), *value));
    }
    wire.extend(encode_command(line.command.unwrap().into()));
    assert!(wire.len() > 4, "expect at least one parameter block plus the command byte");
}

#[test]
fn raster_bytes_always_carry_the_high_bit() {
    let encoded = encode_raster(&[0, 64, 128, 255]);
    assert!(encoded.iter().all(|&b| b >= 0x80));
}

#[test]
fn firmware_version_is_sticky_across_status_cycles() {
    let mut engine = connected_engine();
    let version_bytes = param_bytes(InfoValue::Version.into(), 250.0);
    feed_all(&mut engine, &version_bytes);
    feed_all(&mut engine, &[StatusMarker::End.into()]);
    let snapshot = engine.last_snapshot().expect("status snapshot expected");
    assert_eq!(snapshot.firmware_version, Some(2.5));
}
