use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

use super::Credentials;
use crate::exec::{ExecError, Invocation, Runner};

const DESIGNER_BINARY: &str = "1cv8";

/// Timestamp suffix of dump files: `<name>-2024-03-01-21-00-00.dt`.
pub const DUMP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
pub const DUMP_EXTENSION: &str = "dt";

/// The 1C platform in designer mode, used to dump an infobase into a `.dt` file.
#[derive(Debug, Clone)]
pub struct Designer<R> {
    runner: R,
    designer: PathBuf,
}

/// Files produced by a designer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFiles {
    pub dump: PathBuf,
    pub out_log: PathBuf,
    pub result_log: PathBuf,
}

impl DumpFiles {
    /// Generates the file names for a dump of `name` in `dir`.
    pub fn generate(dir: &Path, name: &str, now: NaiveDateTime) -> Self {
        let stem = format!("{name}-{}", now.format(DUMP_TIMESTAMP_FORMAT));
        Self {
            dump: dir.join(format!("{stem}.{DUMP_EXTENSION}")),
            out_log: dir.join(format!("{stem}.out.log")),
            result_log: dir.join(format!("{stem}.result.log")),
        }
    }

    pub fn dump_file_name(&self) -> String {
        self.dump
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl<R: Runner> Designer<R> {
    pub fn new(runner: R, path_1c: &Path) -> Self {
        Self {
            runner,
            designer: path_1c.join(DESIGNER_BINARY),
        }
    }

    /// Runs `1cv8 CONFIG /DumpIB`.
    ///
    /// The exit status of the designer is only logged. Whether a dump was
    /// created is decided by the caller based on the existence of the file.
    pub fn dump(
        &self,
        host: &str,
        name: &str,
        credentials: &Credentials,
        files: &DumpFiles,
    ) -> Result<(), ExecError> {
        let invocation = Invocation::new(&self.designer)
            .arg("CONFIG")
            .arg("/DumpIB")
            .arg(files.dump.to_string_lossy())
            .arg("/Out")
            .arg(files.out_log.to_string_lossy())
            .arg("/S")
            .arg(format!("{host}\\{name}"))
            .arg("/N")
            .arg(&credentials.user)
            .arg("/P")
            .secret_arg(&credentials.password)
            .arg("/DumpResult")
            .arg(files.result_log.to_string_lossy());

        log::info!(target: "onec::designer", "Dumping infobase {name} to {}", files.dump.display());
        let captured = self.runner.run(&invocation)?;
        if captured.success {
            log::debug!(target: "onec::designer", "Designer finished");
        } else {
            log::warn!(target: "onec::designer", "Designer exited with code {:?}", captured.code);
        }

        Ok(())
    }
}

impl DumpFiles {
    /// Relays the designer logs and removes them.
    pub fn discard_logs(&self) {
        for (title, log_file) in [("Log", &self.out_log), ("Result", &self.result_log)] {
            let Ok(content) = fs::read(log_file) else {
                continue;
            };
            let content = String::from_utf8_lossy(&content);
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                log::info!(target: "onec::designer", "{title}: {}", line.trim_end());
            }

            match fs::remove_file(log_file) {
                Ok(()) => log::debug!(target: "onec::designer", "Removed log file {}", log_file.display()),
                Err(e) => log::warn!(target: "onec::designer", "Removing {} failed: {e}", log_file.display()),
            }
        }
    }
}

/// Current local time used for dump names.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
