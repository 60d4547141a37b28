use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::process::Command;
use tokio::time::timeout;

/// Deadline for a single external command invocation
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts before a timing-out command takes the daemon down
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub enum CmdError {
    /// Command exceeded its deadline on every attempt [command, attempts]
    Timeout(String, u32),
    /// Command ran but exited non-zero [command, stderr]
    Failed(String, String),
    /// Command could not be spawned [command, reason]
    Io(String, io::Error),
}

impl CmdError {
    /// Exhausted timeouts are the only command error the daemon treats as
    /// fatal; everything else is handled at the call site
    pub fn is_timeout(&self) -> bool {
        matches!(self, CmdError::Timeout(..))
    }
}

impl fmt::Display for CmdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CmdError::*;
        match self {
            Timeout(cmd, attempts) => {
                write!(f, "Unable to run '{}': timed out {} times", cmd, attempts)
            }
            Failed(cmd, stderr) => write!(f, "'{}' failed: {}", cmd, stderr),
            Io(cmd, err) => write!(f, "'{}' could not be spawned: {}", cmd, err),
        }
    }
}

impl std::error::Error for CmdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CmdError::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

/// Seam for invoking the tunnel control plane (`wg`) and the kernel route
/// table (`ip route`). Reconciliation logic runs against this trait so it
/// can be exercised without touching the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and return its stdout
    async fn run(&self, cmd: &[&str]) -> Result<String, CmdError>;
}

/// Runs commands on the host with a per-attempt deadline, retrying timed
/// out attempts up to a bound
pub struct SystemRunner {
    deadline: Duration,
    max_attempts: u32,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::with_deadline(COMMAND_TIMEOUT, MAX_ATTEMPTS)
    }

    pub fn with_deadline(deadline: Duration, max_attempts: u32) -> Self {
        Self {
            deadline,
            max_attempts,
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &[&str]) -> Result<String, CmdError> {
        let (program, args) = cmd.split_first().expect("Command is never empty");
        let display = cmd.join(" ");
        for attempt in 1..=self.max_attempts {
            let mut command = Command::new(program);
            command.args(args).kill_on_drop(true);
            match timeout(self.deadline, command.output()).await {
                Err(_) => {
                    warn!(
                        "'{}' timed out (attempt {}/{})",
                        display, attempt, self.max_attempts
                    );
                }
                Ok(Err(err)) => return Err(CmdError::Io(display, err)),
                Ok(Ok(output)) => {
                    if output.status.success() {
                        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
                    }
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    return Err(CmdError::Failed(display, stderr));
                }
            }
        }
        Err(CmdError::Timeout(display, self.max_attempts))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    pub(crate) enum Reply {
        Ok(String),
        Failed(String),
        Timeout,
    }

    /// Scripted runner for tests: replays canned replies by command prefix
    /// and records every invocation in order
    pub(crate) struct ScriptedRunner {
        replies: Vec<(String, Reply)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self {
                replies: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn on(mut self, prefix: &str, reply: Reply) -> Self {
            self.replies.push((prefix.to_string(), reply));
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &[&str]) -> Result<String, CmdError> {
            let display = cmd.join(" ");
            self.calls.lock().unwrap().push(display.clone());
            for (prefix, reply) in &self.replies {
                if display.starts_with(prefix.as_str()) {
                    return match reply {
                        Reply::Ok(stdout) => Ok(stdout.clone()),
                        Reply::Failed(stderr) => Err(CmdError::Failed(display, stderr.clone())),
                        Reply::Timeout => Err(CmdError::Timeout(display, MAX_ATTEMPTS)),
                    };
                }
            }
            Ok(String::new())
        }
    }
}
