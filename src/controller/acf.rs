//! ACF (Archon configuration file) document model.
//!
//! An ACF is a sectioned key/value text document: `[SYSTEM]` holds backplane
//! and module information, `[CONFIG]` holds the electronics settings, the
//! timing-script lines (`LINE0..LINEn`), `CONSTANTn` definitions, and the
//! parameter table (`PARAMETERn="Name=Value"`). The document is kept as an
//! ordered list of entries so re-emission preserves the original layout, and
//! a secondary index maps named parameters to their numeric slot: editing
//! `Exposures` means locating `PARAMETERk` first, then addressing config line
//! `k` on the wire.
//!
//! Wire addressing: `WCONFIGnnnn`/`RCONFIGnnnn` use the zero-based position
//! of a pair within the `[CONFIG]` section. Keys are stored in their GUI form
//! (backslash-separated modules); [`AcfDocument::wire_lines`] converts to the
//! slash form the controller expects and strips value quoting.

use std::collections::HashMap;

use crate::error::{ArchonError, ArchonResult};

/// One line of an ACF section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcfEntry {
    Pair { key: String, value: String },
    Comment(String),
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcfSection {
    pub name: String,
    pub entries: Vec<AcfEntry>,
}

impl AcfSection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_uppercase(),
            entries: Vec::new(),
        }
    }

    /// Pairs in document order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            AcfEntry::Pair { key, value } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }
}

/// A parsed ACF document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcfDocument {
    sections: Vec<AcfSection>,
}

impl AcfDocument {
    /// Parses an ACF text blob. Section markers are case-insensitive and the
    /// parser tolerates CRLF line endings. Lines before the first marker are
    /// kept in an unnamed preamble section.
    pub fn parse(text: &str) -> ArchonResult<AcfDocument> {
        let mut sections: Vec<AcfSection> = Vec::new();
        let mut current = AcfSection::new("");

        for raw in text.lines() {
            let line = raw.trim_end_matches('\r');
            let trimmed = line.trim();

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                if !current.entries.is_empty() || !current.name.is_empty() {
                    sections.push(current);
                }
                current = AcfSection::new(&trimmed[1..trimmed.len() - 1]);
            } else if trimmed.is_empty() {
                current.entries.push(AcfEntry::Blank);
            } else if trimmed.starts_with(';') || trimmed.starts_with('#') {
                current.entries.push(AcfEntry::Comment(line.to_string()));
            } else if let Some(eq) = line.find('=') {
                current.entries.push(AcfEntry::Pair {
                    key: line[..eq].trim().to_string(),
                    value: line[eq + 1..].trim().to_string(),
                });
            } else {
                return Err(ArchonError::Config(format!(
                    "unparseable ACF line {line:?}"
                )));
            }
        }
        sections.push(current);

        Ok(AcfDocument { sections })
    }

    /// Re-emits the document, preserving section order, entry order, and
    /// comments.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !section.name.is_empty() {
                out.push('[');
                out.push_str(&section.name);
                out.push_str("]\n");
            }
            for entry in &section.entries {
                match entry {
                    AcfEntry::Pair { key, value } => {
                        out.push_str(key);
                        out.push('=');
                        out.push_str(value);
                        out.push('\n');
                    }
                    AcfEntry::Comment(text) => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    AcfEntry::Blank => out.push('\n'),
                }
            }
        }
        out
    }

    pub fn section(&self, name: &str) -> Option<&AcfSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut AcfSection> {
        self.sections
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn config(&self) -> ArchonResult<&AcfSection> {
        self.section("CONFIG")
            .ok_or_else(|| ArchonError::Config("ACF has no [CONFIG] section".to_string()))
    }

    /// Zero-based wire line number of `key` within `[CONFIG]`.
    pub fn line_index(&self, key: &str) -> ArchonResult<usize> {
        self.config()?
            .pairs()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
            .ok_or_else(|| ArchonError::Config(format!("unknown config keyword {key:?}")))
    }

    /// Replaces the value of a `[CONFIG]` pair, returning its wire line
    /// number.
    pub fn set_config_value(&mut self, key: &str, value: &str) -> ArchonResult<usize> {
        let index = self.line_index(key)?;
        let section = self
            .section_mut("CONFIG")
            .expect("CONFIG section checked above");
        let mut seen = 0usize;
        for entry in section.entries.iter_mut() {
            if let AcfEntry::Pair { value: v, .. } = entry {
                if seen == index {
                    *v = value.to_string();
                    return Ok(index);
                }
                seen += 1;
            }
        }
        unreachable!("pair index out of sync");
    }

    /// The parameter table: name (uppercased) to current integer value,
    /// scanned from `PARAMETERn="Name=Value"` entries.
    pub fn parameters(&self) -> ArchonResult<HashMap<String, i64>> {
        let mut params = HashMap::new();
        for (key, value) in self.config()?.pairs() {
            if !is_parameter_key(key) {
                continue;
            }
            if let Some((name, val)) = split_parameter_value(value) {
                if let Ok(val) = val.parse::<i64>() {
                    params.insert(name.to_uppercase(), val);
                }
            }
        }
        Ok(params)
    }

    /// Locates the numeric slot of a named parameter: returns the
    /// `PARAMETERn` key and the wire line number of that entry.
    pub fn parameter_slot(&self, name: &str) -> ArchonResult<(String, usize)> {
        for (index, (key, value)) in self.config()?.pairs().enumerate() {
            if !is_parameter_key(key) {
                continue;
            }
            if let Some((pname, _)) = split_parameter_value(value) {
                if pname.eq_ignore_ascii_case(name) {
                    return Ok((key.to_string(), index));
                }
            }
        }
        Err(ArchonError::Config(format!("unknown parameter {name:?}")))
    }

    /// Rewrites a named parameter's value inside its `PARAMETERn` slot.
    /// Returns the wire line number of the edited entry.
    pub fn set_parameter(&mut self, name: &str, value: i64) -> ArchonResult<usize> {
        let (slot_key, index) = self.parameter_slot(name)?;
        let current = self
            .config()?
            .get(&slot_key)
            .expect("slot key just resolved")
            .to_string();
        let quoted = current.starts_with('"');
        let inner = current.trim_matches('"');
        let pname = split_parameter_value(&current)
            .map(|(n, _)| n.to_string())
            .unwrap_or_else(|| inner.to_string());
        let next = if quoted {
            format!("\"{pname}={value}\"")
        } else {
            format!("{pname}={value}")
        };
        self.set_config_value(&slot_key, &next)?;
        Ok(index)
    }

    /// `[CONFIG]` pairs in controller form: `MODx/KEY=VALUE`, quotes
    /// stripped, one string per `WCONFIGnnnn` line.
    pub fn wire_lines(&self) -> ArchonResult<Vec<String>> {
        Ok(self
            .config()?
            .pairs()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    key.to_uppercase().replace('\\', "/"),
                    value.trim_matches('"')
                )
            })
            .collect())
    }

    /// Number of taps declared by the timing core (`TAPLINES` keyword).
    pub fn taplines(&self) -> ArchonResult<usize> {
        let value = self
            .config()?
            .get("TAPLINES")
            .ok_or_else(|| ArchonError::Config("ACF does not declare TAPLINES".to_string()))?;
        value
            .parse()
            .map_err(|_| ArchonError::Config(format!("bad TAPLINES value {value:?}")))
    }
}

fn is_parameter_key(key: &str) -> bool {
    let upper = key.to_uppercase();
    upper
        .strip_prefix("PARAMETER")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Splits `"Name=Value"` (quotes optional) into name and value.
fn split_parameter_value(value: &str) -> Option<(&str, &str)> {
    let inner = value.trim_matches('"');
    inner
        .split_once('=')
        .map(|(name, val)| (name.trim(), val.trim()))
}
