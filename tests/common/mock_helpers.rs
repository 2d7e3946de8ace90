//! Producer helpers for integration tests
//!
//! Real-process tests run small `/bin/sh` scripts in place of the Python
//! helper. Scripts end with `exec` where they block so that killing the shell
//! kills the only process holding the output pipe.

use crossbeam_channel::Receiver;
use smartscale::config::SessionConfig;
use smartscale::producer::{CommandSpec, ProcessProducer};
use smartscale::session::{AcquisitionSession, ChannelSubscriber, SessionEvent, Subscriber};
use smartscale::store::RecordStore;
use std::sync::Arc;

/// Timing short enough to keep the suite fast
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        liveness_deadline_ms: 400,
        watchdog_interval_ms: 50,
        grace_period_ms: 300,
    }
}

/// Producer running `script` with `sh -c`; the target arrives as `$1`
pub fn shell_producer(script: &str) -> ProcessProducer {
    ProcessProducer::new(
        CommandSpec::new("sh")
            .arg("-c")
            .arg(script)
            .arg("fake-helper"),
    )
}

/// A session over `script` plus a channel receiving all its events
pub struct ShellSession {
    pub session: AcquisitionSession,
    pub events: Receiver<SessionEvent>,
    pub store: RecordStore,
    // Kept alive for the duration of the test; the bus only holds it weakly
    _subscriber: Arc<dyn Subscriber>,
}

pub fn shell_session(script: &str) -> ShellSession {
    shell_session_with(script, fast_session_config())
}

pub fn shell_session_with(script: &str, config: SessionConfig) -> ShellSession {
    let store = RecordStore::new();
    let session = AcquisitionSession::new(Arc::new(shell_producer(script)), store.clone(), config);
    let (subscriber, events) = ChannelSubscriber::unbounded();
    let subscriber: Arc<dyn Subscriber> = subscriber;
    session.subscribe(&subscriber);
    ShellSession {
        session,
        events,
        store,
        _subscriber: subscriber,
    }
}

/// Check whether a process id still refers to a live (non-zombie) process
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
