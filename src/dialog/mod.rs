//! Line-oriented editor for the database sections of the settings file.

use std::io::{self, BufRead, Write};
use std::path::Path;

use derive_more::{Display, Error, From};

use crate::settings::{BaseConfig, Settings, SettingsError};

#[derive(Debug, Display, Error, From)]
pub enum DialogError {
    #[display("Terminal I/O failed: {_0}")]
    #[from]
    Io(io::Error),
    #[display("{_0}")]
    #[from]
    Settings(SettingsError),
    /// Input ended while a value was expected.
    #[display("Input closed")]
    Closed,
}

/// Prompts on `output` and reads answers from `input`.
#[derive(Debug)]
pub struct Dialog<I, O> {
    input: I,
    output: O,
}

impl<I: BufRead, O: Write> Dialog<I, O> {
    pub fn new(input: I, output: O) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self) -> Result<String, DialogError> {
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(DialogError::Closed);
        }
        Ok(line.trim().to_string())
    }

    /// Asks for a value, an empty answer keeps `current`.
    fn prompt(&mut self, label: &str, current: &str) -> Result<String, DialogError> {
        write!(self.output, "{label} [{current}]: ")?;
        let answer = self.read_line()?;
        Ok(if answer.is_empty() {
            current.to_string()
        } else {
            answer
        })
    }

    fn prompt_optional(&mut self, label: &str, current: Option<&str>) -> Result<Option<String>, DialogError> {
        let answer = self.prompt(label, current.unwrap_or_default())?;
        Ok(Some(answer).filter(|a| !a.is_empty()))
    }

    fn prompt_bool(&mut self, label: &str, current: bool) -> Result<bool, DialogError> {
        loop {
            let answer = self.prompt(label, if current { "yes" } else { "no" })?;
            match answer.to_lowercase().as_str() {
                "y" | "yes" | "true" | "on" | "1" => return Ok(true),
                "n" | "no" | "false" | "off" | "0" => return Ok(false),
                _ => writeln!(self.output, "Please answer yes or no.")?,
            }
        }
    }

    /// Lets the user pick database sections by their number.
    ///
    /// An empty answer selects nothing.
    pub fn select_sections(&mut self, settings: &Settings) -> Result<Vec<String>, DialogError> {
        let sections: Vec<String> = settings.database_sections().map(str::to_string).collect();
        if sections.is_empty() {
            writeln!(self.output, "No databases configured.")?;
            return Ok(Vec::new());
        }

        for (idx, section) in sections.iter().enumerate() {
            let description = settings
                .base(section)
                .map(|base| base.description)
                .unwrap_or_default();
            writeln!(self.output, "{:>3}) {section} {description}", idx + 1)?;
        }

        'ask: loop {
            write!(self.output, "Databases to edit (e.g. 1,3): ")?;
            let answer = self.read_line()?;

            let mut selected = Vec::new();
            for token in answer.split([',', ' ']).filter(|t| !t.is_empty()) {
                match token.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                    Some(idx) if idx < sections.len() => {
                        if !selected.contains(&sections[idx]) {
                            selected.push(sections[idx].clone());
                        }
                    }
                    _ => {
                        writeln!(self.output, "Unknown selection: {token}")?;
                        continue 'ask;
                    }
                }
            }
            return Ok(selected);
        }
    }

    /// Prompts every field of `base`, the current values are the defaults.
    ///
    /// The 1C directory is asked again until it contains `rac`.
    pub fn edit_base(&mut self, base: &BaseConfig) -> Result<BaseConfig, DialogError> {
        writeln!(self.output, "[{}]", base.section)?;
        let mut edited = base.clone();

        edited.host = self.prompt_optional("Server host", base.host.as_deref())?;
        edited.port = self.prompt_optional("RAS port", base.port.as_deref())?;
        edited.name = self.prompt_optional("Infobase name", base.name.as_deref())?;
        loop {
            edited.path_1c = self.prompt_optional("1C directory", edited.path_1c.as_deref())?;
            match edited.path_1c.as_deref() {
                Some(dir) if Path::new(dir).join("rac").is_file() => break,
                Some(dir) => writeln!(self.output, "rac not found in {dir}")?,
                None => writeln!(self.output, "The 1C directory is required")?,
            }
        }
        edited.admin = self.prompt("Administrator", &base.admin)?;
        edited.password = self.prompt("Password", &base.password)?;
        edited.backup = self.prompt_optional("Backup share", base.backup.as_deref())?;
        edited.delete = self.prompt_bool("Remove outdated dumps", base.delete)?;
        let period = base.actual_period().to_string();
        edited.actual_period = self.prompt_optional("Actual period (YYYY-MM-DD)", Some(&period))?;
        edited.scheduled_jobs = self.prompt_bool("Deny scheduled jobs", base.scheduled_jobs)?;
        edited.description = self.prompt("Description", &base.description)?;

        Ok(edited)
    }

    /// Edits the selected databases and saves them to `path`.
    ///
    /// Returns the edited databases, ready to be backed up.
    pub fn run(&mut self, settings: &mut Settings, path: &Path) -> Result<Vec<BaseConfig>, DialogError> {
        let mut edited = Vec::new();
        for section in self.select_sections(settings)? {
            let base = self.edit_base(&settings.base(&section)?)?;
            settings.set_base(&base);
            edited.push(base);
        }

        if !edited.is_empty() {
            settings.save(path)?;
            log::info!(target: "dialog", "Saved {} databases to {}", edited.len(), path.display());
        }
        Ok(edited)
    }
}
