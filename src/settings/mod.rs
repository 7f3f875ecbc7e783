//! The settings store.
//!
//! Settings are kept in a sectioned `key = value` file with one section per
//! database and a [`SETTINGS`](GENERAL_SECTION) section listing the active
//! databases and the report configuration:
//!
//! ```ini
//! [SETTINGS]
//! bases = ['SALES']
//! report_enable = True
//! report_to = ['admin@example.com']
//! smtp_server = mail.example.com
//!
//! [SALES]
//! host = srv-1c
//! port = 1545
//! name = SALES
//! path_1c = /opt/1cv8/x86_64
//! backup = nfs://nas:/backup/1c
//! description = Sales department
//! ```
//!
//! Files ending in `.toml` carry the same sections as TOML tables.

mod ini;
mod lenient;
mod value;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use serde_json::{Map, Value};

pub use ini::IniError;
pub use value::{format_value, parse_value};

use crate::onec::{Credentials, DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD};
use crate::util::retention::{ActualPeriod, DEFAULT_ACTUAL_PERIOD};

/// Name of the section holding the general settings.
pub const GENERAL_SECTION: &str = "SETTINGS";
pub const DEFAULT_SETTINGS_FILE: &str = "./settings.ini";

/// Key/value pairs of one section.
pub type Section = Map<String, Value>;

/// Misspelled keys still read from older files, with their current name.
const RENAMED_KEYS: &[(&str, &str)] = &[("schduled_jobs", "scheduled_jobs")];

/// Inserts `key`, dropping an older spelling of it from the section.
fn insert_key(section: &mut Section, key: String, value: Value) {
    for (old, new) in RENAMED_KEYS {
        if key == *new {
            section.remove(*old);
        }
    }
    section.insert(key, value);
}

#[derive(Debug, Display, Error, From)]
pub enum SettingsError {
    /// Reading or writing the settings file failed.
    #[display("Accessing settings file {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The settings file is malformed.
    #[display("Malformed settings file: {_0}")]
    #[from]
    Ini(IniError),
    #[display("Malformed TOML settings: {_0}")]
    #[from]
    TomlRead(toml::de::Error),
    #[display("Serializing TOML settings failed: {_0}")]
    #[from]
    TomlWrite(toml::ser::Error),
    /// A section can't be interpreted.
    #[display("Invalid section [{section}]: {source}")]
    Section {
        section: String,
        source: serde_json::Error,
    },
    /// The section of a database doesn't exist.
    #[display("Section [{_0}] not found")]
    UnknownSection(#[error(ignore)] String),
}

/// Format of the settings file, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ini,
    Toml,
}

impl Format {
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Ini,
        }
    }
}

/// All sections of a settings file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    sections: BTreeMap<String, Section>,
}

impl Settings {
    pub fn from_ini_str(text: &str) -> Result<Self, SettingsError> {
        Ok(Self {
            sections: ini::parse(text)?,
        })
    }

    pub fn to_ini_string(&self) -> String {
        ini::render(&self.sections)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let sections = toml::from_str(text)?;
        Ok(Self { sections })
    }

    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        // TOML has no null, drop unset keys
        let sections: BTreeMap<&String, BTreeMap<&String, &Value>> = self
            .sections
            .iter()
            .map(|(name, section)| {
                let values = section.iter().filter(|(_, v)| !v.is_null()).collect();
                (name, values)
            })
            .collect();
        Ok(toml::to_string_pretty(&sections)?)
    }

    /// Loads the settings file at `path`.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        let text = fs::read_to_string(path).map_err(io_err)?;
        log::debug!(target: "settings", "Loading settings from {}", path.display());

        match Format::of(path) {
            Format::Ini => Self::from_ini_str(&text),
            Format::Toml => Self::from_toml_str(&text),
        }
    }

    /// Writes the settings to `path`.
    ///
    /// Sections and keys already present in the file but unknown to `self`
    /// are kept.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut merged = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        merged.merge(self);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = match Format::of(path) {
            Format::Ini => merged.to_ini_string(),
            Format::Toml => merged.to_toml_string()?,
        };
        fs::write(path, text).map_err(io_err)?;
        log::debug!(target: "settings", "Saved settings to {}", path.display());

        Ok(())
    }

    fn merge(&mut self, other: &Settings) {
        for (name, section) in &other.sections {
            let target = self.sections.entry(name.clone()).or_default();
            for (key, value) in section {
                insert_key(target, key.clone(), value.clone());
            }
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sets `key` in `section`, creating the section if needed.
    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        let section = self.sections.entry(section.to_string()).or_default();
        insert_key(section, key.to_lowercase(), value);
    }

    /// Names of all database sections.
    pub fn database_sections(&self) -> impl Iterator<Item = &str> {
        self.sections
            .keys()
            .map(String::as_str)
            .filter(|name| *name != GENERAL_SECTION)
    }

    /// General settings, defaults if the section is absent.
    pub fn general(&self) -> Result<GeneralSettings, SettingsError> {
        self.typed_section(GENERAL_SECTION)
            .map(Option::unwrap_or_default)
    }

    /// The database configured in `section`.
    pub fn base(&self, section: &str) -> Result<BaseConfig, SettingsError> {
        let mut base: BaseConfig = self
            .typed_section(section)?
            .ok_or_else(|| SettingsError::UnknownSection(section.to_string()))?;
        base.section = section.to_string();
        Ok(base)
    }

    /// Writes `base` back into its section.
    ///
    /// Values are stored the way they are read back from the file.
    pub fn set_base(&mut self, base: &BaseConfig) {
        let Ok(Value::Object(values)) = serde_json::to_value(base) else {
            return;
        };
        for (key, value) in values {
            let value = match value {
                Value::Null => continue,
                Value::String(s) => parse_value(&s),
                other => other,
            };
            self.set(&base.section, &key, value);
        }
    }

    fn typed_section<T: serde::de::DeserializeOwned>(
        &self,
        section: &str,
    ) -> Result<Option<T>, SettingsError> {
        let Some(values) = self.sections.get(section) else {
            return Ok(None);
        };
        serde_json::from_value(Value::Object(values.clone()))
            .map(Some)
            .map_err(|source| SettingsError::Section {
                section: section.to_string(),
                source,
            })
    }
}

/// Contents of the [`SETTINGS`](GENERAL_SECTION) section.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Sections of the databases to back up, in order.
    #[serde(deserialize_with = "lenient::list")]
    pub bases: Vec<String>,

    #[serde(deserialize_with = "lenient::bool")]
    pub report_enable: bool,
    #[serde(deserialize_with = "lenient::string")]
    pub report_from: Option<String>,
    #[serde(deserialize_with = "lenient::list")]
    pub report_to: Vec<String>,
    #[serde(deserialize_with = "lenient::string_or_empty")]
    pub report_subject: String,
    #[serde(deserialize_with = "lenient::list")]
    pub report_attachments: Vec<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub smtp_server: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub smtp_server_port: Option<u64>,
    #[serde(deserialize_with = "lenient::string")]
    pub smtp_login: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub smtp_password: Option<String>,

    /// Password fed to `sudo` when mounting the backup share.
    #[serde(deserialize_with = "lenient::string")]
    pub root_password: Option<String>,
    /// Directory for dumps and mount points.
    #[serde(deserialize_with = "lenient::string")]
    pub work_dir: Option<String>,
    /// Seconds to wait for terminated sessions to disappear.
    #[serde(deserialize_with = "lenient::number")]
    pub session_drain: Option<u64>,
    /// Seconds to pause after the designer exits.
    #[serde(deserialize_with = "lenient::number")]
    pub after_dump: Option<u64>,
}

/// Configuration of one database to back up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BaseConfig {
    /// Name of the settings section, not stored as a key.
    #[serde(skip)]
    pub section: String,

    /// Host of the 1C server running `ras`.
    #[serde(deserialize_with = "lenient::string")]
    pub host: Option<String>,
    /// Port of the `ras` service.
    #[serde(deserialize_with = "lenient::string")]
    pub port: Option<String>,
    /// Name of the infobase.
    #[serde(deserialize_with = "lenient::string")]
    pub name: Option<String>,
    /// Directory of the installed 1C platform, e.g. `/opt/1cv8/x86_64`.
    #[serde(deserialize_with = "lenient::string")]
    pub path_1c: Option<String>,
    /// Share receiving the dumps, e.g. `nfs://nas:/backup/1c`.
    #[serde(deserialize_with = "lenient::string")]
    pub backup: Option<String>,
    /// Remove dumps older than [`actual_period`](Self::actual_period) from the share.
    #[serde(deserialize_with = "lenient::bool")]
    pub delete: bool,
    #[serde(deserialize_with = "lenient::string")]
    pub actual_period: Option<String>,
    #[serde(deserialize_with = "lenient::string_or_empty")]
    pub admin: String,
    #[serde(deserialize_with = "lenient::string_or_empty")]
    pub password: String,
    /// Deny scheduled jobs while the dump is taken.
    #[serde(alias = "schduled_jobs", deserialize_with = "lenient::bool")]
    pub scheduled_jobs: bool,
    #[serde(deserialize_with = "lenient::string_or_empty")]
    pub description: String,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            section: String::new(),
            host: None,
            port: None,
            name: None,
            path_1c: None,
            backup: None,
            delete: false,
            actual_period: None,
            admin: DEFAULT_ADMIN.to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
            scheduled_jobs: false,
            description: String::new(),
        }
    }
}

/// Fields needed to reach the infobase through `rac`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RacTarget<'a> {
    pub host: &'a str,
    pub port: &'a str,
    pub name: &'a str,
    pub path_1c: &'a Path,
}

/// Fields that have to be set before a dump can be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget<'a> {
    pub host: &'a str,
    pub port: &'a str,
    pub name: &'a str,
    pub path_1c: &'a Path,
    pub backup: &'a str,
}

/// Required fields missing from a [BaseConfig].
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("missing required settings: {}", _0.join(", "))]
pub struct MissingFields(#[error(ignore)] pub Vec<&'static str>);

impl BaseConfig {
    /// Name used in logs and reports.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.section)
    }

    pub fn credentials(&self) -> Credentials {
        let mut credentials = Credentials::default();
        if !self.admin.is_empty() {
            credentials.user = self.admin.clone();
        }
        if !self.password.is_empty() {
            credentials.password = self.password.clone();
        }
        credentials
    }

    /// Retention period, falling back to the default on invalid values.
    pub fn actual_period(&self) -> ActualPeriod {
        let raw = self.actual_period.as_deref().unwrap_or(DEFAULT_ACTUAL_PERIOD);
        raw.parse().unwrap_or_else(|e| {
            log::warn!(target: "settings", "Ignoring actual_period of {}: {e}", self.display_name());
            ActualPeriod::default()
        })
    }

    /// Checks that every field needed to administer the infobase is present.
    pub fn rac_target(&self) -> Result<RacTarget<'_>, MissingFields> {
        let missing = self.missing(false);
        match (&self.host, &self.port, &self.name, &self.path_1c) {
            (Some(host), Some(port), Some(name), Some(path_1c)) => Ok(RacTarget {
                host,
                port,
                name,
                path_1c: Path::new(path_1c),
            }),
            _ => Err(MissingFields(missing)),
        }
    }

    /// Checks that every field needed for a dump is present.
    pub fn target(&self) -> Result<BackupTarget<'_>, MissingFields> {
        let missing = self.missing(true);
        match (&self.host, &self.port, &self.name, &self.path_1c, &self.backup) {
            (Some(host), Some(port), Some(name), Some(path_1c), Some(backup)) => Ok(BackupTarget {
                host,
                port,
                name,
                path_1c: Path::new(path_1c),
                backup,
            }),
            _ => Err(MissingFields(missing)),
        }
    }

    fn missing(&self, with_backup: bool) -> Vec<&'static str> {
        let mut fields = vec![
            ("host", &self.host),
            ("port", &self.port),
            ("name", &self.name),
            ("path_1c", &self.path_1c),
        ];
        if with_backup {
            fields.push(("backup", &self.backup));
        }
        fields
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(field, _)| field)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SETTINGS: &str = "\
[SETTINGS]
bases = ['SALES']
report_enable = True
report_to = admin@example.com
smtp_server = mail.example.com
smtp_server_port = '2525'

[SALES]
host = srv-1c
port = 1545
name = SALES
path_1c = /opt/1cv8/x86_64
backup = nfs://nas:/backup/1c
schduled_jobs = True
description = Sales department

[HR]
name = HR
";

    #[test]
    fn general_settings_are_coerced() {
        let settings = Settings::from_ini_str(SETTINGS).unwrap();
        let general = settings.general().unwrap();

        assert_eq!(general.bases, vec!["SALES"]);
        assert!(general.report_enable);
        assert_eq!(general.report_to, vec!["admin@example.com"]);
        assert_eq!(general.smtp_server.as_deref(), Some("mail.example.com"));
        assert_eq!(general.smtp_server_port, Some(2525));
        assert_eq!(general.session_drain, None);
    }

    #[test]
    fn base_config_reads_section() {
        let settings = Settings::from_ini_str(SETTINGS).unwrap();
        let base = settings.base("SALES").unwrap();

        assert_eq!(base.section, "SALES");
        assert_eq!(base.port.as_deref(), Some("1545"));
        assert!(base.scheduled_jobs);
        assert!(!base.delete);
        assert_eq!(base.credentials(), Credentials::default());

        let target = base.target().unwrap();
        assert_eq!(target.host, "srv-1c");
        assert_eq!(target.path_1c, Path::new("/opt/1cv8/x86_64"));
    }

    #[test]
    fn incomplete_base_lists_missing_fields() {
        let settings = Settings::from_ini_str(SETTINGS).unwrap();
        let base = settings.base("HR").unwrap();

        assert_eq!(
            base.target().unwrap_err(),
            MissingFields(vec!["host", "port", "path_1c", "backup"])
        );
    }

    #[test]
    fn rac_target_does_not_need_a_share() {
        let mut base = Settings::from_ini_str(SETTINGS).unwrap().base("SALES").unwrap();
        base.backup = None;

        assert_eq!(base.target().unwrap_err(), MissingFields(vec!["backup"]));
        let target = base.rac_target().unwrap();
        assert_eq!(target.name, "SALES");
        assert_eq!(target.port, "1545");

        base.host = None;
        assert_eq!(base.rac_target().unwrap_err(), MissingFields(vec!["host"]));
    }

    #[test]
    fn unknown_section_is_an_error() {
        let settings = Settings::from_ini_str(SETTINGS).unwrap();
        assert!(matches!(
            settings.base("PAYROLL"),
            Err(SettingsError::UnknownSection(name)) if name == "PAYROLL"
        ));
    }

    #[test]
    fn database_sections_exclude_general() {
        let settings = Settings::from_ini_str(SETTINGS).unwrap();
        let names: Vec<_> = settings.database_sections().collect();
        assert_eq!(names, vec!["HR", "SALES"]);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/settings.ini");

        let mut settings = Settings::default();
        settings.set(GENERAL_SECTION, "bases", json!(["SALES", "HR"]));
        settings.set(GENERAL_SECTION, "smtp_server_port", json!(25));
        settings.set("SALES", "host", json!("srv-1c"));
        settings.set("SALES", "delete", json!(true));
        settings.set("SALES", "description", json!("Отдел продаж"));
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn save_keeps_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        fs::write(&path, SETTINGS).unwrap();

        let mut settings = Settings::load(&path).unwrap();
        let mut base = settings.base("SALES").unwrap();
        base.host = Some("srv-2".to_string());
        settings.set_base(&base);

        let mut only_sales = Settings::default();
        only_sales.set_base(&base);
        only_sales.save(&path).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded, settings);
        assert_eq!(reloaded.base("SALES").unwrap().host.as_deref(), Some("srv-2"));
        assert_eq!(reloaded.base("HR").unwrap().name.as_deref(), Some("HR"));
    }

    #[test]
    fn saving_replaces_misspelled_scheduled_jobs_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        fs::write(&path, SETTINGS).unwrap();

        let mut settings = Settings::load(&path).unwrap();
        let base = settings.base("SALES").unwrap();
        settings.set_base(&base);
        settings.save(&path).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        let sales = reloaded.section("SALES").unwrap();
        assert!(!sales.contains_key("schduled_jobs"));
        assert_eq!(sales["scheduled_jobs"], json!(true));
        assert!(reloaded.base("SALES").unwrap().scheduled_jobs);

        // saving a section alone must not bring the old key back either
        let mut only_sales = Settings::default();
        only_sales.set_base(&base);
        fs::write(&path, SETTINGS).unwrap();
        only_sales.save(&path).unwrap();
        assert!(Settings::load(&path).unwrap().base("SALES").unwrap().scheduled_jobs);
    }

    #[test]
    fn toml_settings() {
        let text = r#"
[SETTINGS]
bases = ["SALES"]

[SALES]
host = "srv-1c"
port = 1545
scheduled_jobs = true
"#;
        let settings = Settings::from_toml_str(text).unwrap();
        assert_eq!(settings.general().unwrap().bases, vec!["SALES"]);
        let base = settings.base("SALES").unwrap();
        assert_eq!(base.port.as_deref(), Some("1545"));
        assert!(base.scheduled_jobs);

        let rendered = settings.to_toml_string().unwrap();
        assert_eq!(Settings::from_toml_str(&rendered).unwrap(), settings);
    }
}
