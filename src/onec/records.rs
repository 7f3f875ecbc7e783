//! Records printed by the `rac` administration client.
//!
//! `rac` prints every object as a block of `key : value` lines and
//! separates the blocks with an empty line:
//!
//! ```text
//! infobase : 1a2b3c4d-0000-0000-0000-000000000001
//! name     : SALES
//! descr    : "Sales department"
//! ```
//!
//! The parser is keyed on the labels instead of line positions so that
//! additional or reordered fields in newer platform versions don't shift
//! the values.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_-]*)\s*:\s?(.*?)\s*$").expect("field regex is valid")
});

/// One block of labeled fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn insert(&mut self, key: &str, value: &str) {
        self.fields.insert(key.to_string(), unquote(value).to_string());
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Splits `rac` output into [Record]s.
///
/// A record ends at an empty line or when one of its keys repeats.
/// Lines that aren't `key : value` pairs are ignored.
pub fn parse_records(output: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::default();

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }

        let Some(captures) = FIELD.captures(line) else {
            log::trace!(target: "onec::records", "Ignoring line: {line}");
            continue;
        };
        let key = &captures[1];
        let value = &captures[2];

        if current.contains(key) {
            records.push(std::mem::take(&mut current));
        }
        current.insert(key, value);
    }

    if !current.is_empty() {
        records.push(current);
    }

    records
}

/// Converts records into typed objects, dropping records without an id.
fn typed<T>(output: &str, kind: &str, convert: impl Fn(&Record) -> Option<T>) -> Vec<T> {
    parse_records(output)
        .iter()
        .filter_map(|record| {
            let object = convert(record);
            if object.is_none() {
                log::warn!(target: "onec::records", "Skipping {kind} record without id: {record:?}");
            }
            object
        })
        .collect()
}

fn non_empty(record: &Record, key: &str) -> Option<String> {
    record
        .get(key)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn field(record: &Record, key: &str) -> String {
    record.get(key).unwrap_or_default().to_string()
}

/// A cluster of the 1C application server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub host: String,
    pub port: String,
    pub name: String,
}

impl Cluster {
    pub fn parse_list(output: &str) -> Vec<Self> {
        typed(output, "cluster", |record| {
            Some(Self {
                id: non_empty(record, "cluster")?,
                host: field(record, "host"),
                port: field(record, "port"),
                name: field(record, "name"),
            })
        })
    }
}

/// An infobase as listed by `rac infobase summary list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Infobase {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl Infobase {
    pub fn parse_list(output: &str) -> Vec<Self> {
        typed(output, "infobase", |record| {
            Some(Self {
                id: non_empty(record, "infobase")?,
                name: field(record, "name"),
                description: field(record, "descr"),
            })
        })
    }

    /// Case-insensitive comparison of the infobase name.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

/// A session connected to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub number: String,
    pub infobase: String,
    pub user_name: String,
    pub app_id: String,
    pub host: String,
}

impl Session {
    pub fn parse_list(output: &str) -> Vec<Self> {
        typed(output, "session", |record| {
            Some(Self {
                id: non_empty(record, "session")?,
                number: field(record, "session-id"),
                infobase: field(record, "infobase"),
                user_name: field(record, "user-name"),
                app_id: field(record, "app-id"),
                host: field(record, "host"),
            })
        })
    }
}

/// A lock held on an infobase object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub connection: String,
    pub session: String,
    pub object: String,
    pub descr: String,
}

impl Lock {
    pub fn parse_list(output: &str) -> Vec<Self> {
        parse_records(output)
            .iter()
            .map(|record| Self {
                connection: field(record, "connection"),
                session: field(record, "session"),
                object: field(record, "object"),
                descr: field(record, "descr"),
            })
            .collect()
    }
}
