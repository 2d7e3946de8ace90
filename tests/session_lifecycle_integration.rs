//! Integration tests for the acquisition session against real helper processes
//!
//! The helper is played by `/bin/sh` scripts printing the same line protocol.

#![cfg(unix)]

mod common;

use common::builders::MeasurementBuilder;
use common::mock_helpers::*;
use common::test_timeout;
use serial_test::serial;
use smartscale::config::SessionConfig;
use smartscale::producer::ProcessExit;
use smartscale::session::{collect_until_ended, SessionEvent};
use smartscale::{FailureReason, ScaleError, SessionState};
use std::time::{Duration, Instant};

fn sample_lines(count: i64) -> String {
    (0..count)
        .map(|i| {
            let line = MeasurementBuilder::new()
                .offset(i)
                .weight(70.0 + i as f64)
                .line();
            format!("echo '{}'", line)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn patient_config() -> SessionConfig {
    SessionConfig {
        liveness_deadline_ms: 10_000,
        ..fast_session_config()
    }
}

#[test]
#[serial]
fn test_helper_exit_zero_ends_cleanly() {
    let s = shell_session(&format!("{}; exit 0", sample_lines(3)));
    s.session.start("AA:BB:CC:DD:EE:FF").unwrap();

    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();
    assert_eq!(reason, None);
    assert_eq!(events.len(), 3);
    for (i, event) in events.iter().enumerate() {
        let expected = MeasurementBuilder::new()
            .offset(i as i64)
            .weight(70.0 + i as f64)
            .build();
        assert_eq!(event, &SessionEvent::Measurement(expected));
    }

    assert_eq!(s.session.wait_until_settled(test_timeout()), SessionState::Stopped);
    assert_eq!(s.store.len(), 3);
    assert_eq!(s.session.exit_status(), Some(ProcessExit::Code(0)));

    let stats = s.session.stats();
    assert_eq!(stats.lines_received, 3);
    assert_eq!(stats.measurements, 3);
    assert_eq!(stats.protocol_errors, 0);
}

#[test]
#[serial]
fn test_target_is_passed_to_helper() {
    let line = MeasurementBuilder::new().line();
    let script = format!(
        "case \"$1\" in AA:BB:CC:DD:EE:FF) echo '{}'; exit 0;; *) exit 9;; esac",
        line
    );
    let s = shell_session(&script);
    // Surrounding whitespace is not part of the address
    s.session.start("  AA:BB:CC:DD:EE:FF  ").unwrap();

    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();
    assert_eq!(reason, None);
    assert_eq!(events.len(), 1);
    assert_eq!(s.session.target().as_deref(), Some("AA:BB:CC:DD:EE:FF"));
}

#[test]
#[serial]
fn test_nonzero_exit_fails_session() {
    let s = shell_session(&format!("{}; exit 3", sample_lines(1)));
    s.session.start("AA:BB").unwrap();

    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(reason, Some(FailureReason::AbnormalExit(3)));
    assert_eq!(
        s.session.wait_until_settled(test_timeout()),
        SessionState::Failed(FailureReason::AbnormalExit(3))
    );
    // Readings received before the failure are kept
    assert_eq!(s.store.len(), 1);
}

#[test]
#[serial]
fn test_error_lines_are_published() {
    let s = shell_session(&format!(
        "echo 'ERROR: Device not found'; echo 'garbage'; {}; exit 1",
        sample_lines(1)
    ));
    s.session.start("AA:BB").unwrap();

    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();
    assert_eq!(reason, Some(FailureReason::AbnormalExit(1)));
    assert_eq!(events.len(), 3);

    match &events[0] {
        SessionEvent::ProtocolError(e) => {
            assert_eq!(e.message, "Device not found");
            assert!(e.is_reported());
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    match &events[1] {
        SessionEvent::ProtocolError(e) => {
            assert!(!e.is_reported());
            assert_eq!(e.raw.as_deref(), Some("garbage"));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert!(matches!(events[2], SessionEvent::Measurement(_)));

    let stats = s.session.stats();
    assert_eq!(stats.protocol_errors, 2);
    assert_eq!(stats.measurements, 1);
    assert_eq!(s.store.len(), 1);
}

#[test]
#[serial]
fn test_silent_helper_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let script = format!(
        "echo $$ > '{}'; {}; exec sleep 30",
        pid_file.display(),
        sample_lines(1)
    );
    let s = shell_session(&script);

    let started = Instant::now();
    s.session.start("AA:BB").unwrap();
    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();

    assert_eq!(reason, Some(FailureReason::Timeout));
    assert_eq!(events.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(
        s.session.wait_until_settled(test_timeout()),
        SessionState::Failed(FailureReason::Timeout)
    );

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!process_alive(pid), "helper {} still running", pid);

    // Exactly one end notification
    std::thread::sleep(Duration::from_millis(200));
    assert!(s.events.try_recv().is_err());
}

#[test]
#[serial]
fn test_steady_output_keeps_session_alive() {
    let line = MeasurementBuilder::new().line();
    // One line every 100ms for well past the 400ms deadline
    let script = format!("i=0; while [ $i -lt 12 ]; do echo '{}'; sleep 0.1; i=$((i+1)); done; exit 0", line);
    let s = shell_session(&script);
    s.session.start("AA:BB").unwrap();

    let (events, reason) = collect_until_ended(&s.events, test_timeout()).unwrap();
    assert_eq!(reason, None);
    assert_eq!(events.len(), 12);
}

#[test]
#[serial]
fn test_user_stop_terminates_helper() {
    let s = shell_session_with(&format!("{}; exec sleep 30", sample_lines(2)), patient_config());
    s.session.start("AA:BB").unwrap();

    for _ in 0..2 {
        let event = s.events.recv_timeout(test_timeout()).unwrap();
        assert!(matches!(event, SessionEvent::Measurement(_)));
    }

    let started = Instant::now();
    s.session.stop();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(s.session.status(), SessionState::Stopped);
    assert_eq!(
        s.events.recv_timeout(test_timeout()).unwrap(),
        SessionEvent::SessionEnded(None)
    );

    // Second stop is a no-op
    s.session.stop();
    assert_eq!(s.session.status(), SessionState::Stopped);
    std::thread::sleep(Duration::from_millis(100));
    assert!(s.events.try_recv().is_err());
}

#[test]
#[serial]
fn test_stop_escalates_when_helper_ignores_term() {
    let script = format!(
        "trap '' TERM; {}; while true; do sleep 0.05; done",
        sample_lines(1)
    );
    let s = shell_session_with(&script, patient_config());
    s.session.start("AA:BB").unwrap();
    assert!(matches!(
        s.events.recv_timeout(test_timeout()).unwrap(),
        SessionEvent::Measurement(_)
    ));

    let started = Instant::now();
    s.session.stop();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(s.session.status(), SessionState::Stopped);
    assert_eq!(s.session.exit_status(), Some(ProcessExit::Signal));
}

#[test]
#[serial]
fn test_second_start_is_rejected() {
    let s = shell_session_with("exec sleep 30", patient_config());
    s.session.start("AA:BB").unwrap();

    let err = s.session.start("AA:BB").unwrap_err();
    assert!(matches!(err, ScaleError::AlreadyActive(SessionState::Streaming)));

    s.session.stop();
    let err = s.session.start("AA:BB").unwrap_err();
    assert!(matches!(err, ScaleError::AlreadyActive(SessionState::Stopped)));
}

#[test]
#[serial]
fn test_missing_helper_fails_to_start() {
    use smartscale::producer::{CommandSpec, ProcessProducer};
    use smartscale::store::RecordStore;
    use smartscale::AcquisitionSession;
    use std::sync::Arc;

    let producer = ProcessProducer::new(CommandSpec::new("/nonexistent/stream_ble"));
    let session = AcquisitionSession::new(Arc::new(producer), RecordStore::new(), fast_session_config());

    let err = session.start("AA:BB").unwrap_err();
    assert!(matches!(err, ScaleError::SpawnFailure(_)));
    assert!(matches!(
        session.status(),
        SessionState::Failed(FailureReason::Spawn(_))
    ));
}

#[test]
#[serial]
fn test_dropping_session_stops_helper() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("helper.pid");
    let s = shell_session_with(
        &format!("echo $$ > '{}'; {}; exec sleep 30", pid_file.display(), sample_lines(1)),
        patient_config(),
    );
    s.session.start("AA:BB").unwrap();
    s.events.recv_timeout(test_timeout()).unwrap();

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    drop(s);
    assert!(!process_alive(pid), "helper {} still running", pid);
}
