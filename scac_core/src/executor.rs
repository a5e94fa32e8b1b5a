use crate::error::{Result, ScacError};
use std::ffi::OsString;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared flag telling in-flight invocations of a batch to stop.
///
/// Clones observe the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A fully resolved command line for one instrumented run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "exited abnormally".to_string(),
        }
    }
}

/// Runs one child process to completion, feeding stdin and capturing both
/// output streams.
///
/// There is no timeout unless one is configured. Cancellation is checked
/// while the child runs; a cancelled child is killed and reaped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn run(
        &self,
        spec: &CommandSpec,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(ScacError::Cancelled);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Own process group, so a kill also reaches whatever the tool forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        trace!(program = ?spec.program, args = ?spec.args, "spawning");
        let mut child = cmd.spawn().map_err(|e| {
            ScacError::oracle(
                format!("failed to spawn command {:?}: {e}", spec.program),
                String::new(),
            )
        })?;

        // The writer runs on its own thread so a target that never reads
        // stdin cannot block us against a full pipe.
        let stdin_writer = child.stdin.take().map(|mut pipe| {
            let payload = stdin.to_vec();
            thread::spawn(move || match pipe.write_all(&payload) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let status = self.wait(&mut child, cancel)?;

        if let Some(handle) = stdin_writer {
            join_thread(handle, "stdin writer")?;
        }
        let mut output = ProcessOutput {
            stdout: match stdout_reader {
                Some(handle) => join_thread(handle, "stdout reader")?,
                None => Vec::new(),
            },
            stderr: match stderr_reader {
                Some(handle) => join_thread(handle, "stderr reader")?,
                None => Vec::new(),
            },
            exit_code: status.code(),
            signal: None,
        };
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            output.signal = status.signal();
        }

        debug!(program = ?spec.program, status = %output.describe_exit(), "child finished");
        Ok(output)
    }

    fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if cancel.is_cancelled() {
                        debug!("batch cancelled, killing child");
                        kill_and_reap(child);
                        return Err(ScacError::Cancelled);
                    }
                    if let Some(timeout) = self.timeout {
                        if start_time.elapsed() > timeout {
                            warn!(?timeout, "instrumented run timed out, killing");
                            kill_and_reap(child);
                            return Err(ScacError::oracle(
                                format!("instrumented run timed out after {timeout:?}"),
                                String::new(),
                            ));
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    kill_and_reap(child);
                    return Err(e.into());
                }
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join_thread<T>(handle: JoinHandle<std::io::Result<T>>, what: &str) -> Result<T> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(ScacError::oracle(
            format!("{what} thread panicked"),
            String::new(),
        )),
    }
}

/// Kills the child's whole process group, then reaps the child.
#[cfg(unix)]
fn kill_and_reap(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!("failed to kill process group {}: {e}", child.id());
            if let Err(e) = child.kill() {
                warn!("failed to kill child process: {e}");
            }
        }
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("failed to kill child process: {e}");
    }
    let _ = child.wait();
}
