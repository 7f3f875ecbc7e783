//! Reading and writing the sectioned `key = value` settings format.

use std::collections::BTreeMap;
use std::fmt::Write;

use derive_more::{Display, Error};

use super::value::{format_value, parse_value};
use super::Section;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum IniError {
    /// A key appeared before the first `[section]` header.
    #[display("line {line}: key outside of a section: {content}")]
    MissingSectionHeader { line: usize, content: String },
    /// The line is neither a header, a comment nor a `key = value` pair.
    #[display("line {line}: unable to parse: {content}")]
    Syntax { line: usize, content: String },
}

/// Parses settings text into sections.
///
/// Keys are case-folded to lower case. Lines starting with `#` or `;` are
/// comments, indented lines continue the value of the previous key.
pub fn parse(text: &str) -> Result<BTreeMap<String, Section>, IniError> {
    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    let mut raw: Vec<(String, String, String)> = Vec::new();
    let mut section: Option<String> = None;
    let mut continues = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continues = false;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if continues && line.starts_with(char::is_whitespace) {
            if let Some((_, _, value)) = raw.last_mut() {
                value.push('\n');
                value.push_str(trimmed);
                continue;
            }
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            section = Some(name);
            continues = false;
            continue;
        }

        let Some(delimiter) = trimmed.find(['=', ':']) else {
            return Err(IniError::Syntax {
                line: line_no,
                content: trimmed.to_string(),
            });
        };
        let Some(section) = &section else {
            return Err(IniError::MissingSectionHeader {
                line: line_no,
                content: trimmed.to_string(),
            });
        };

        let key = trimmed[..delimiter].trim().to_lowercase();
        if key.is_empty() {
            return Err(IniError::Syntax {
                line: line_no,
                content: trimmed.to_string(),
            });
        }
        let value = trimmed[delimiter + 1..].trim().to_string();
        raw.push((section.clone(), key, value));
        continues = true;
    }

    for (section, key, value) in raw {
        let value = parse_value(&value);
        log::trace!(target: "settings", "{section}.{key} = {value}");
        sections.entry(section).or_default().insert(key, value);
    }

    Ok(sections)
}

/// Renders sections as settings text.
pub fn render(sections: &BTreeMap<String, Section>) -> String {
    let mut out = String::new();
    for (name, section) in sections {
        let _ = writeln!(out, "[{name}]");
        for (key, value) in section {
            let value = format_value(value).replace('\n', "\n\t");
            let _ = writeln!(out, "{key} = {value}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SETTINGS: &str = "\
; backups of the accounting server
[SETTINGS]
bases = ['SALES', 'HR']
report_enable = True
smtp_server_port: 25

[SALES]
Host = srv-1c
port = 1545
description = Sales department
  second line
backup = nfs://nas:/backup/#1c
";

    #[test]
    fn parses_sections_keys_and_literals() {
        let sections = parse(SETTINGS).unwrap();
        assert_eq!(sections.len(), 2);

        let general = &sections["SETTINGS"];
        assert_eq!(general["bases"], json!(["SALES", "HR"]));
        assert_eq!(general["report_enable"], json!(true));
        assert_eq!(general["smtp_server_port"], json!(25));

        let sales = &sections["SALES"];
        assert_eq!(sales["host"], json!("srv-1c"));
        assert_eq!(sales["port"], json!(1545));
        assert_eq!(sales["description"], json!("Sales department\nsecond line"));
        assert_eq!(sales["backup"], json!("nfs://nas:/backup/#1c"));
    }

    #[test]
    fn rejects_keys_outside_sections() {
        let err = parse("host = srv\n").unwrap_err();
        assert!(matches!(err, IniError::MissingSectionHeader { line: 1, .. }));
    }

    #[test]
    fn rejects_lines_without_delimiter() {
        let err = parse("[A]\njust words\n").unwrap_err();
        assert_eq!(
            err,
            IniError::Syntax {
                line: 2,
                content: "just words".to_string()
            }
        );
    }

    #[test]
    fn render_then_parse_keeps_everything() {
        let sections = parse(SETTINGS).unwrap();
        let rendered = render(&sections);
        assert_eq!(parse(&rendered).unwrap(), sections);
        assert!(rendered.contains("[SALES]\n"));
        assert!(rendered.contains("bases = ['SALES', 'HR']\n"));
    }
}
