//! Invocation of external programs.
//!
//! Every interaction with the 1C platform and the operating system goes
//! through a [Runner]. The [SystemRunner] spawns real processes, tests
//! substitute their own implementation.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use derive_more::{Display, Error};

const MASK: &str = "***";

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    secrets: Vec<usize>,
    stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secrets: Vec::new(),
            stdin: None,
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

    /// Appends an argument that is masked when the command is displayed.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secrets.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Data written to the standard input of the process.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Returns the value of a `--key=value` argument.
    pub fn flag_value(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|arg| {
            arg.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Name of the program without its directory.
    pub fn program_name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for (idx, arg) in self.args.iter().enumerate() {
            if self.secrets.contains(&idx) {
                match arg.split_once('=') {
                    Some((key, _)) if key.starts_with("--") => write!(f, " {key}={MASK}")?,
                    _ => write!(f, " {MASK}")?,
                }
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    /// A successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A run that exited with `code`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Non-empty trimmed lines of the standard output.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

#[derive(Debug, Display, Error)]
pub enum ExecError {
    /// The process could not be spawned at all.
    #[display("Unable to run {command}: {source}")]
    NotRun { command: String, source: io::Error },
    /// The process exited unsuccessfully.
    #[display("{command} failed (exit code {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Executes [Invocation]s and waits for their completion.
pub trait Runner {
    /// Runs the command to completion.
    ///
    /// A process that exits unsuccessfully is *not* an error here; use
    /// [`Runner::run_checked`] for that.
    fn run(&self, invocation: &Invocation) -> Result<Captured, ExecError>;

    /// Runs the command and fails on an unsuccessful exit status.
    fn run_checked(&self, invocation: &Invocation) -> Result<Captured, ExecError> {
        let captured = self.run(invocation)?;
        if captured.success {
            Ok(captured)
        } else {
            Err(ExecError::Failed {
                command: invocation.to_string(),
                code: captured.code,
                stderr: captured.stderr.trim().to_string(),
            })
        }
    }
}

impl<R: Runner + ?Sized> Runner for &R {
    fn run(&self, invocation: &Invocation) -> Result<Captured, ExecError> {
        (**self).run(invocation)
    }
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<Captured, ExecError> {
        log::debug!(target: "exec", "Running: {invocation}");

        let not_run = |source| ExecError::NotRun {
            command: invocation.to_string(),
            source,
        };

        let mut command = Command::new(invocation.program());
        command
            .args(invocation.get_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if invocation.get_stdin().is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn().map_err(not_run)?;
        if let (Some(input), Some(mut stdin)) = (invocation.get_stdin(), child.stdin.take()) {
            // a child that exits without reading its input still has a status to report
            match stdin.write_all(input.as_bytes()) {
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    log::debug!(target: "exec", "{} didn't read its input", invocation.program_name());
                }
                result => result.map_err(not_run)?,
            }
            // stdin is closed on drop so the child sees EOF
        }
        let output = child.wait_with_output().map_err(not_run)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // relay stderr
        if !stderr.trim().is_empty() {
            log::warn!(target: "exec", "{}: {}", invocation.program_name(), stderr.trim_end());
        }

        Ok(Captured {
            success: output.status.success(),
            code: output.status.code(),
            stdout,
            stderr,
        })
    }
}
