use std::{
    ffi::OsString,
    io::{self, Read},
    path::PathBuf,
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::trace;

use crate::string_or_bytes::StringOrBytes;

pub type CommandLine = Vec<OsString>;

const WAIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found. Is it installed in the system path?")]
    Missing { tool: String },
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool:   String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}\nstderr:\n{stderr:#?}")]
    Failed {
        tool:   String,
        status: ExitStatus,
        stderr: StringOrBytes,
    },
    #[error("could not find {expected} in the output of {tool}")]
    Parse {
        tool:     String,
        expected: &'static str,
    },
    #[error("{tool} did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("empty command line")]
    EmptyCommand,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Output of the last stage of a [`ProcessChain`].
#[derive(Debug)]
pub struct ChainOutput {
    pub stdout: Vec<u8>,
    pub stderr: StringOrBytes,
}

/// A pipeline of external processes, each stage reading the previous
/// stage's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessChain {
    stages:  Vec<CommandLine>,
    timeout: Option<Duration>,
}

impl ProcessChain {
    #[inline]
    pub fn new(first: CommandLine) -> Self {
        Self {
            stages:  vec![first],
            timeout: None,
        }
    }

    /// Kills the whole chain if it runs longer than `timeout`.
    #[must_use]
    #[inline]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    #[inline]
    pub fn pipe(mut self, next: CommandLine) -> Self {
        self.stages.push(next);
        self
    }

    #[inline]
    pub fn stages(&self) -> &[CommandLine] {
        &self.stages
    }

    /// Runs every stage to completion. Stderr of all stages is drained on
    /// separate threads so no pipe buffer can stall the chain.
    ///
    /// When several stages fail, the error of the last one is reported, as
    /// upstream stages usually only die from the broken pipe.
    #[inline]
    pub fn run(&self) -> Result<ChainOutput, ToolError> {
        let mut children: Vec<(String, Child)> = Vec::with_capacity(self.stages.len());
        let mut previous: Option<ChildStdout> = None;

        for stage in &self.stages {
            let Some((program, args)) = stage.split_first() else {
                kill_all(&mut children);
                return Err(ToolError::EmptyCommand);
            };
            let tool = program.to_string_lossy().into_owned();
            trace!("spawning {tool} {args:?}");

            let stdin = previous.take().map_or_else(Stdio::null, Stdio::from);
            let spawned = Command::new(program)
                .args(args)
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();

            match spawned {
                Ok(mut child) => {
                    previous = child.stdout.take();
                    children.push((tool, child));
                },
                Err(e) => {
                    kill_all(&mut children);
                    return Err(spawn_error(tool, e));
                },
            }
        }

        let stderr_threads = children
            .iter_mut()
            .map(|(_, child)| {
                let stderr = child.stderr.take();
                thread::spawn(move || {
                    let mut buf = Vec::new();
                    if let Some(mut stderr) = stderr {
                        stderr.read_to_end(&mut buf).ok();
                    }
                    buf
                })
            })
            .collect::<Vec<_>>();

        let stdout_thread = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut out) = previous {
                out.read_to_end(&mut buf).ok();
            }
            buf
        });

        let timeout = self.timeout;
        let waited = settle(&mut children, |children| match timeout {
            Some(timeout) => wait_with_timeout(children, timeout),
            None => wait_all(children),
        });
        let stdout = stdout_thread.join().unwrap_or_default();
        let mut stderrs = stderr_threads
            .into_iter()
            .map(|handle| StringOrBytes::from(handle.join().unwrap_or_default()))
            .collect::<Vec<_>>();
        let mut statuses = waited?;

        if let Some(index) = statuses.iter().rposition(|(_, status)| !status.success()) {
            let (tool, status) = statuses.swap_remove(index);
            return Err(ToolError::Failed {
                tool,
                status,
                stderr: stderrs.swap_remove(index),
            });
        }

        Ok(ChainOutput {
            stdout,
            stderr: stderrs.pop().unwrap_or_else(|| String::new().into()),
        })
    }
}

/// Runs a single command to completion.
#[inline]
pub fn run_command(cmd: CommandLine) -> Result<ChainOutput, ToolError> {
    ProcessChain::new(cmd).run()
}

/// Resolves a tool on `PATH`.
#[inline]
pub fn ensure_tool(tool: &str) -> Result<PathBuf, ToolError> {
    which::which(tool).map_err(|_| ToolError::Missing {
        tool: tool.to_owned(),
    })
}

fn spawn_error(tool: String, e: io::Error) -> ToolError {
    if e.kind() == io::ErrorKind::NotFound {
        ToolError::Missing {
            tool,
        }
    } else {
        ToolError::Spawn {
            tool,
            source: e,
        }
    }
}

type Statuses = Vec<(String, ExitStatus)>;

/// Waits for the chain with `wait`. If waiting fails the remaining stages are
/// killed, which closes their pipes and lets the reader threads finish.
fn settle<F>(children: &mut [(String, Child)], wait: F) -> Result<Statuses, ToolError>
where
    F: FnOnce(&mut [(String, Child)]) -> Result<Statuses, ToolError>,
{
    let waited = wait(children);
    if waited.is_err() {
        kill_all(children);
    }
    waited
}

fn wait_all(children: &mut [(String, Child)]) -> Result<Statuses, ToolError> {
    let mut statuses = Vec::with_capacity(children.len());
    for (tool, child) in children {
        statuses.push((tool.clone(), child.wait()?));
    }
    Ok(statuses)
}

fn wait_with_timeout(
    children: &mut [(String, Child)],
    timeout: Duration,
) -> Result<Statuses, ToolError> {
    let deadline = Instant::now() + timeout;
    let mut statuses: Vec<Option<ExitStatus>> = vec![None; children.len()];

    loop {
        let mut running = None;
        for (index, (tool, child)) in children.iter_mut().enumerate() {
            if statuses[index].is_none() {
                match child.try_wait()? {
                    Some(status) => statuses[index] = Some(status),
                    None => running = Some(tool.clone()),
                }
            }
        }

        let Some(tool) = running else {
            break;
        };
        if Instant::now() >= deadline {
            kill_all(children);
            return Err(ToolError::Timeout {
                tool,
                after: timeout,
            });
        }
        thread::sleep(WAIT_POLL);
    }

    Ok(children
        .iter()
        .zip(statuses)
        .filter_map(|((tool, _), status)| status.map(|status| (tool.clone(), status)))
        .collect())
}

fn kill_all(children: &mut [(String, Child)]) {
    for (_, child) in children {
        let _ = child.kill();
        let _ = child.wait();
    }
}
