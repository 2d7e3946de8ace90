//! Child-process producer
//!
//! Launches the acquisition helper with the target device as its last
//! argument, reads its stdout line by line and forwards its stderr to the log.

use super::{LineSource, ProcessControl, ProcessExit, Producer, ProducerHandle, Termination};
use crate::error::{Result, ScaleError};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;

/// Program and leading arguments of an external helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments placed before the per-run argument
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Spec for `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build a `Command` with stdin closed and stdout/stderr piped
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Producer that runs the helper as a child process
#[derive(Debug, Clone)]
pub struct ProcessProducer {
    spec: CommandSpec,
}

impl ProcessProducer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

impl Producer for ProcessProducer {
    fn launch(&self, target: &str) -> Result<ProducerHandle> {
        tracing::info!("Launching helper: {} {}", self.spec, target);

        let mut child = self
            .spec
            .command()
            .arg(target)
            .spawn()
            .map_err(|e| {
                ScaleError::SpawnFailure(format!("{}: {}", self.spec.program.display(), e))
            })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ScaleError::SpawnFailure(
                    "helper stdout was not captured".to_string(),
                ));
            }
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        tracing::debug!("Helper running with pid {}", child.id());
        Ok(ProducerHandle {
            lines: Box::new(ChildLines {
                reader: BufReader::new(stdout),
                buf: Vec::with_capacity(256),
            }),
            control: Box::new(ChildControl { child, exit: None }),
        })
    }

    fn describe(&self) -> String {
        self.spec.to_string()
    }
}

/// Log the helper's stderr until it closes
fn forward_stderr(stderr: ChildStderr) {
    let spawned = thread::Builder::new()
        .name("smartscale-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(io::Result::ok) {
                tracing::debug!(target: "smartscale::helper", "{}", line);
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Failed to spawn stderr forwarder: {}", e);
    }
}

struct ChildLines {
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
}

impl LineSource for ChildLines {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

struct ChildControl {
    child: Child,
    /// Set once the child has been reaped; its pid must not be signalled after that
    exit: Option<ProcessExit>,
}

impl ProcessControl for ChildControl {
    fn terminate(&mut self, how: Termination) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        match how {
            #[cfg(unix)]
            Termination::Graceful => {
                let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
            #[cfg(not(unix))]
            Termination::Graceful => self.child.kill(),
            Termination::Forced => self.child.kill(),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(ProcessExit::from);
        }
        Ok(self.exit)
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = ProcessExit::from(self.child.wait()?);
        self.exit = Some(exit);
        Ok(exit)
    }

    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for ChildControl {
    fn drop(&mut self) {
        if let Ok(None) = self.try_wait() {
            tracing::warn!("Killing helper {} left running", self.child.id());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::producer::shutdown;
    use std::time::Duration;

    fn sh(script: &str) -> ProcessProducer {
        ProcessProducer::new(CommandSpec::new("sh").arg("-c").arg(script).arg("helper"))
    }

    #[test]
    fn test_reads_lines_and_exit_code() {
        let producer = sh("echo \"first $1\"; printf 'second\\r\\n'; exit 3");
        let mut handle = producer.launch("AA:BB").unwrap();

        assert_eq!(handle.lines.read_line().unwrap().as_deref(), Some("first AA:BB"));
        assert_eq!(handle.lines.read_line().unwrap().as_deref(), Some("second"));
        assert_eq!(handle.lines.read_line().unwrap(), None);
        assert_eq!(handle.control.wait().unwrap(), ProcessExit::Code(3));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let producer = sh("printf 'a\\377b\\n'");
        let mut handle = producer.launch("x").unwrap();
        assert_eq!(handle.lines.read_line().unwrap().as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn test_missing_program_is_spawn_failure() {
        let producer = ProcessProducer::new(CommandSpec::new("/nonexistent/smartscale-helper"));
        let err = producer.launch("x").unwrap_err();
        assert!(matches!(err, ScaleError::SpawnFailure(_)));
    }

    #[test]
    fn test_graceful_shutdown_unblocks_reader() {
        let producer = sh("exec sleep 30");
        let mut handle = producer.launch("x").unwrap();

        let exit = shutdown(handle.control.as_mut(), Duration::from_secs(2)).unwrap();
        assert_eq!(exit, ProcessExit::Signal);
        assert_eq!(handle.lines.read_line().unwrap(), None);
    }

    #[test]
    fn test_shutdown_escalates_when_sigterm_ignored() {
        let producer = sh("trap '' TERM; echo ready; while :; do sleep 0.05; done");
        let mut handle = producer.launch("x").unwrap();
        assert_eq!(handle.lines.read_line().unwrap().as_deref(), Some("ready"));

        let exit = shutdown(handle.control.as_mut(), Duration::from_millis(200)).unwrap();
        assert_eq!(exit, ProcessExit::Signal);
    }

    #[test]
    fn test_terminate_after_exit_is_noop() {
        let producer = sh("exit 0");
        let mut handle = producer.launch("x").unwrap();
        assert_eq!(handle.control.wait().unwrap(), ProcessExit::Code(0));
        assert!(handle.control.terminate(Termination::Graceful).is_ok());
        assert!(handle.control.terminate(Termination::Forced).is_ok());
    }
}
