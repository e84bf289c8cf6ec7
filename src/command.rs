use crate::error::ZbakError;
use crate::Result;
use log::debug;
use std::fmt;
use std::process::{Command, Stdio};
use std::str::FromStr;

/// An external program with its arguments, as configured or built at runtime
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

    /// Parse a configured command line; an empty line yields `None`
    pub fn parse_optional(line: &str) -> Result<Option<Self>> {
        if line.trim().is_empty() {
            Ok(None)
        } else {
            line.parse().map(Some)
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

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Replace `{key}` placeholders in the arguments
    pub fn substitute(mut self, key: &str, value: &str) -> Self {
        let placeholder = format!("{{{key}}}");
        for arg in &mut self.args {
            if arg.contains(&placeholder) {
                *arg = arg.replace(&placeholder, value);
            }
        }
        self
    }

    pub fn has_placeholder(&self, key: &str) -> bool {
        let placeholder = format!("{{{key}}}");
        self.args.iter().any(|arg| arg.contains(&placeholder))
    }

    /// A `std::process::Command` ready to be wired up by the caller
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    /// Run to completion and return stdout, failing on a non-zero exit status
    pub fn run(&self) -> Result<String> {
        debug!("running {self}");
        let output = self
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ZbakError::Command {
                command: self.to_string(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ZbakError::Command {
                command: self.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl FromStr for CommandLine {
    type Err = ZbakError;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = shell_words::split(s)
            .map_err(|e| ZbakError::config(format!("Invalid command line '{s}': {e}")))?;
        if words.is_empty() {
            return Err(ZbakError::config("Command line must not be empty"));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        write!(f, "{}", shell_words::join(words))
    }
}
