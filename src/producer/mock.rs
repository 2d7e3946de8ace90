//! Scripted producer for testing without a scale
//!
//! [`MockProducer`] hands out a fake process whose output is fed line by line
//! through a [`MockFeed`]. Termination requests are recorded and close the
//! output, the same way killing a real helper closes its stdout.

use super::{LineSource, ProcessControl, ProcessExit, Producer, ProducerHandle, Termination};
use crate::error::{Result, ScaleError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

enum FeedEvent {
    Line(String),
    ReadError(String),
    Close,
}

#[derive(Default)]
struct ProcessState {
    exit: Option<ProcessExit>,
    terminations: Vec<Termination>,
    launches: Vec<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ProcessState>,
    exited: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the exit unless the process already ended; returns true if it did now
    fn set_exit(&self, exit: ProcessExit) -> bool {
        let mut state = self.lock();
        if state.exit.is_some() {
            return false;
        }
        state.exit = Some(exit);
        self.exited.notify_all();
        true
    }
}

/// Fake producer driven by a [`MockFeed`]
pub struct MockProducer {
    shared: Arc<Shared>,
    events: Mutex<Option<Receiver<FeedEvent>>>,
    sender: Sender<FeedEvent>,
    failure: Option<String>,
    ignore_graceful: bool,
    launch_delay: Duration,
}

/// Test-side handle that scripts what the fake process does
#[derive(Clone)]
pub struct MockFeed {
    shared: Arc<Shared>,
    sender: Sender<FeedEvent>,
}

impl MockProducer {
    /// A producer that launches successfully exactly once
    pub fn new() -> (Self, MockFeed) {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = unbounded();
        let feed = MockFeed {
            shared: shared.clone(),
            sender: tx.clone(),
        };
        let producer = Self {
            shared,
            events: Mutex::new(Some(rx)),
            sender: tx,
            failure: None,
            ignore_graceful: false,
            launch_delay: Duration::ZERO,
        };
        (producer, feed)
    }

    /// A producer whose launch always fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        let (mut producer, _feed) = Self::new();
        producer.failure = Some(message.into());
        producer
    }

    /// Make the fake process ignore graceful termination requests
    pub fn ignoring_graceful(mut self) -> Self {
        self.ignore_graceful = true;
        self
    }

    /// Block in `launch` for this long before returning
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }
}

impl Producer for MockProducer {
    fn launch(&self, target: &str) -> Result<ProducerHandle> {
        self.shared.lock().launches.push(target.to_string());
        if !self.launch_delay.is_zero() {
            thread::sleep(self.launch_delay);
        }
        if let Some(message) = &self.failure {
            return Err(ScaleError::SpawnFailure(message.clone()));
        }

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ScaleError::SpawnFailure("mock producer already launched".into()))?;

        Ok(ProducerHandle {
            lines: Box::new(MockLines {
                events,
                closed: false,
            }),
            control: Box::new(MockControl {
                shared: self.shared.clone(),
                sender: self.sender.clone(),
                ignore_graceful: self.ignore_graceful,
            }),
        })
    }

    fn describe(&self) -> String {
        "mock producer".to_string()
    }
}

impl MockFeed {
    /// Emit one output line
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.sender.send(FeedEvent::Line(line.into()));
    }

    /// Make the next read fail with an I/O error
    pub fn read_error(&self, message: impl Into<String>) {
        let _ = self.sender.send(FeedEvent::ReadError(message.into()));
    }

    /// Exit on its own with `code`, closing the output
    pub fn exit(&self, code: i32) {
        self.shared.set_exit(ProcessExit::Code(code));
        let _ = self.sender.send(FeedEvent::Close);
    }

    /// Termination requests received so far, in order
    pub fn terminations(&self) -> Vec<Termination> {
        self.shared.lock().terminations.clone()
    }

    /// Targets passed to `launch`, in order
    pub fn launches(&self) -> Vec<String> {
        self.shared.lock().launches.clone()
    }

    /// Check if the fake process has ended
    pub fn has_exited(&self) -> bool {
        self.shared.lock().exit.is_some()
    }
}

struct MockLines {
    events: Receiver<FeedEvent>,
    closed: bool,
}

impl LineSource for MockLines {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }
        match self.events.recv() {
            Ok(FeedEvent::Line(line)) => Ok(Some(line)),
            Ok(FeedEvent::ReadError(message)) => Err(io::Error::other(message)),
            Ok(FeedEvent::Close) | Err(_) => {
                self.closed = true;
                Ok(None)
            }
        }
    }
}

struct MockControl {
    shared: Arc<Shared>,
    sender: Sender<FeedEvent>,
    ignore_graceful: bool,
}

impl ProcessControl for MockControl {
    fn terminate(&mut self, how: Termination) -> io::Result<()> {
        self.shared.lock().terminations.push(how);
        if how == Termination::Graceful && self.ignore_graceful {
            return Ok(());
        }
        if self.shared.set_exit(ProcessExit::Signal) {
            let _ = self.sender.send(FeedEvent::Close);
        }
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.shared.lock().exit)
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        let mut state = self.shared.lock();
        loop {
            if let Some(exit) = state.exit {
                return Ok(exit);
            }
            state = self
                .shared
                .exited
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
