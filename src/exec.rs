use std::{
    fmt,
    process::{Child, Command, Stdio},
};

#[cfg(test)]
use mockall::automock;

use crate::error::NetCtrlError;

/// A fully-formed platform command: program plus arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Handle to a command that was dispatched without waiting for it.
///
/// Dropping the handle leaves the command running; `wait` gives strong
/// confirmation that the rule is in force.
#[derive(Debug)]
pub struct PendingCommand {
    command: String,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Running(Child),
    Finished(Option<i32>),
}

impl PendingCommand {
    pub fn running(command: &CommandLine, child: Child) -> Self {
        Self {
            command: command.to_string(),
            state: PendingState::Running(child),
        }
    }

    /// A command whose exit code is already known
    pub fn finished(command: &CommandLine, code: Option<i32>) -> Self {
        Self {
            command: command.to_string(),
            state: PendingState::Finished(code),
        }
    }

    /// Block until the command exits; nonzero exit becomes `RuleCommandFailed`
    pub fn wait(self) -> Result<(), NetCtrlError> {
        let code = match self.state {
            PendingState::Running(mut child) => child.wait()?.code(),
            PendingState::Finished(code) => code,
        };
        check_exit(self.command, code)
    }
}

/// Capability to execute platform configuration commands
#[cfg_attr(test, automock)]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return the exit code (`None` when killed by a signal)
    fn status(&self, command: &CommandLine) -> Result<Option<i32>, NetCtrlError>;

    /// Run to completion and return the first line of stdout, if any
    fn first_line(&self, command: &CommandLine) -> Result<Option<String>, NetCtrlError>;

    /// Start the command and return without waiting for it
    fn dispatch(&self, command: &CommandLine) -> Result<PendingCommand, NetCtrlError>;
}

/// Run a rule-creating command; anything but exit status zero is an error
pub fn run_checked(runner: &dyn CommandRunner, command: &CommandLine) -> Result<(), NetCtrlError> {
    log::debug!("running: {command}");
    let code = runner.status(command)?;
    check_exit(command.to_string(), code)
}

/// Run a cleanup command whose failure means "already absent"
pub fn run_best_effort(runner: &dyn CommandRunner, command: &CommandLine) {
    log::debug!("running (best effort): {command}");
    match runner.status(command) {
        Ok(Some(0)) => {}
        Ok(code) => log::debug!("ignoring exit code {code:?} from {command}"),
        Err(err) => log::warn!("ignoring failure of cleanup command: {err}"),
    }
}

fn check_exit(command: String, code: Option<i32>) -> Result<(), NetCtrlError> {
    if code == Some(0) {
        Ok(())
    } else {
        Err(NetCtrlError::RuleCommandFailed { command, code })
    }
}

/// Executes commands on the host with stdio silenced
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn status(&self, command: &CommandLine) -> Result<Option<i32>, NetCtrlError> {
        let status = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| NetCtrlError::CommandSpawn {
                command: command.program().to_string(),
                source,
            })?;
        Ok(status.code())
    }

    fn first_line(&self, command: &CommandLine) -> Result<Option<String>, NetCtrlError> {
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| NetCtrlError::CommandSpawn {
                command: command.program().to_string(),
                source,
            })?;
        Ok(first_line_of(&String::from_utf8_lossy(&output.stdout)))
    }

    fn dispatch(&self, command: &CommandLine) -> Result<PendingCommand, NetCtrlError> {
        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| NetCtrlError::CommandSpawn {
                command: command.program().to_string(),
                source,
            })?;
        log::debug!("dispatched in background: {command}");
        Ok(PendingCommand::running(command, child))
    }
}

/// Prints mutating commands instead of running them.
///
/// Read-only discovery (`first_line`) still runs on the host so that
/// interface selection behaves as it would for real.
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn status(&self, command: &CommandLine) -> Result<Option<i32>, NetCtrlError> {
        println!("[dry-run] {command}");
        Ok(Some(0))
    }

    fn first_line(&self, command: &CommandLine) -> Result<Option<String>, NetCtrlError> {
        SystemRunner.first_line(command)
    }

    fn dispatch(&self, command: &CommandLine) -> Result<PendingCommand, NetCtrlError> {
        println!("[dry-run] {command} &");
        Ok(PendingCommand::finished(command, Some(0)))
    }
}

fn first_line_of(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
