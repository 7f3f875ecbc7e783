use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Days, Months, NaiveDateTime};
use derive_more::{Display, Error};

use crate::onec::{DUMP_EXTENSION, DUMP_TIMESTAMP_FORMAT};

/// Dumps are considered actual for one month unless configured otherwise.
pub const DEFAULT_ACTUAL_PERIOD: &str = "0000-01-00";

/// Period in which a dump stays actual, written as `YYYY-MM-DD`.
///
/// `0000-00-10` keeps dumps for ten days, `0001-06-00` for a year and a half.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActualPeriod {
    pub years: u32,
    pub months: u32,
    pub days: u32,
}

impl Default for ActualPeriod {
    fn default() -> Self {
        Self {
            years: 0,
            months: 1,
            days: 0,
        }
    }
}

/// The actual period isn't of the form `YYYY-MM-DD`.
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("Invalid actual period, expected YYYY-MM-DD: {_0}")]
pub struct InvalidActualPeriod(#[error(ignore)] String);

impl FromStr for ActualPeriod {
    type Err = InvalidActualPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidActualPeriod(s.to_string());
        let mut parts = s.trim().split('-').map(|part| part.parse::<u32>());

        let (Some(Ok(years)), Some(Ok(months)), Some(Ok(days)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            years,
            months,
            days,
        })
    }
}

impl fmt::Display for ActualPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.years, self.months, self.days)
    }
}

impl ActualPeriod {
    /// Oldest timestamp still considered actual at `now`.
    pub fn cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        let months = self.years.saturating_mul(12).saturating_add(self.months);
        now.checked_sub_months(Months::new(months))
            .and_then(|t| t.checked_sub_days(Days::new(u64::from(self.days))))
            .unwrap_or(NaiveDateTime::MIN)
    }
}

/// Timestamp of a dump of `name` encoded in `file_name`.
///
/// Returns [None] for files of other databases or other naming schemes.
pub fn dump_timestamp(file_name: &str, name: &str) -> Option<NaiveDateTime> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !extension.eq_ignore_ascii_case(DUMP_EXTENSION) {
        return None;
    }

    // timestamp has a fixed width: YYYY-MM-DD-HH-MM-SS
    let split = stem.len().checked_sub(19)?;
    if !stem.is_char_boundary(split) {
        return None;
    }
    let (prefix, timestamp) = stem.split_at(split);
    let prefix = prefix.strip_suffix('-')?;
    if prefix.to_lowercase() != name.trim().to_lowercase() {
        return None;
    }

    NaiveDateTime::parse_from_str(timestamp, DUMP_TIMESTAMP_FORMAT).ok()
}

/// Dumps of `name` in `dir` which are older than the `period`.
pub fn outdated_dumps(
    dir: &Path,
    name: &str,
    period: ActualPeriod,
    now: NaiveDateTime,
) -> io::Result<Vec<PathBuf>> {
    let cutoff = period.cutoff(now);
    let mut outdated = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(timestamp) = file_name.to_str().and_then(|f| dump_timestamp(f, name)) else {
            continue;
        };
        if timestamp < cutoff {
            outdated.push(entry.path());
        }
    }

    outdated.sort();
    Ok(outdated)
}

/// Removes dumps of `name` older than `period` and returns the removed files.
///
/// `keep` is never removed, regardless of its timestamp.
pub fn prune(
    dir: &Path,
    name: &str,
    period: ActualPeriod,
    now: NaiveDateTime,
    keep: &Path,
) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dump in outdated_dumps(dir, name, period, now)? {
        if dump == keep {
            continue;
        }
        match fs::remove_file(&dump) {
            Ok(()) => {
                log::info!(target: "retention", "Removed outdated dump {}", dump.display());
                removed.push(dump);
            }
            Err(e) => {
                log::warn!(target: "retention", "Removing outdated dump {} failed: {e}", dump.display());
            }
        }
    }
    Ok(removed)
}
