// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RPSL object text parsing.
//!
//! Routing Policy Specification Language objects are blocks of
//! `attribute: value` lines. The first attribute names the object class and
//! its value is the object's primary key. Values may continue across lines:
//! a continuation line starts with a space, a tab, or `+`.
//!
//! # Example
//!
//! ```
//! use nrtm_mirror::rpsl;
//!
//! let obj = rpsl::parse("route: 192.0.2.0/24\norigin: AS65536\n").unwrap();
//! assert_eq!(obj.class, "route");
//! assert_eq!(obj.primary_key, "192.0.2.0/24");
//! assert_eq!(obj.attributes.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpslError {
    #[error("object text is empty")]
    Empty,
    #[error("line {0} is not an attribute: {1:?}")]
    NotAnAttribute(usize, String),
    #[error("continuation line {0} precedes any attribute")]
    DanglingContinuation(usize),
    #[error("object has an empty primary key")]
    EmptyPrimaryKey,
}

/// A single `key: value` pair. Duplicate keys are permitted and order is
/// preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpslAttribute {
    pub name: String,
    pub value: String,
}

/// A parsed RPSL object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpslObject {
    /// Object class, i.e. the name of the first attribute, lowercased
    pub class: String,
    /// Value of the first attribute
    pub primary_key: String,
    /// All attributes in source order, duplicates included
    pub attributes: Vec<RpslAttribute>,
}

impl RpslObject {
    /// First value for `name` (case-insensitive), if present.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.value.as_str())
    }
}

/// Parse a single RPSL object from its text form.
///
/// Blank lines before the first attribute are skipped; a blank line after
/// the first attribute ends the object (any trailing text is ignored, as a
/// snapshot record carries exactly one object). Lines starting with `%` are
/// comments and are dropped.
pub fn parse(text: &str) -> Result<RpslObject, RpslError> {
    let mut attributes: Vec<RpslAttribute> = Vec::new();
    let mut started = false;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        if raw.starts_with('%') {
            continue;
        }
        if raw.trim().is_empty() {
            if started {
                break;
            }
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') || raw.starts_with('+') {
            // Continuation of the previous attribute value
            let Some(last) = attributes.last_mut() else {
                return Err(RpslError::DanglingContinuation(lineno));
            };
            let continued = raw.trim_start_matches(['+', ' ', '\t']).trim_end();
            if !continued.is_empty() {
                if !last.value.is_empty() {
                    last.value.push(' ');
                }
                last.value.push_str(continued);
            }
            continue;
        }
        let Some((name, value)) = raw.split_once(':') else {
            return Err(RpslError::NotAnAttribute(lineno, raw.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(RpslError::NotAnAttribute(lineno, raw.to_string()));
        }
        started = true;
        attributes.push(RpslAttribute {
            name: name.to_string(),
            value: value.trim().to_string(),
        });
    }

    let Some(first) = attributes.first() else {
        return Err(RpslError::Empty);
    };
    if first.value.is_empty() {
        return Err(RpslError::EmptyPrimaryKey);
    }

    Ok(RpslObject {
        class: first.name.to_ascii_lowercase(),
        primary_key: first.value.clone(),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_object() {
        let obj = parse("route: 192.0.2.0/24\norigin: AS65536\nsource: EXAMPLE\n").unwrap();
        assert_eq!(obj.class, "route");
        assert_eq!(obj.primary_key, "192.0.2.0/24");
        assert_eq!(obj.attributes.len(), 3);
        assert_eq!(obj.first("origin"), Some("AS65536"));
        assert_eq!(obj.first("SOURCE"), Some("EXAMPLE"));
    }

    #[test]
    fn test_class_is_lowercased() {
        let obj = parse("Mntner: MAINT-EXAMPLE\n").unwrap();
        assert_eq!(obj.class, "mntner");
        assert_eq!(obj.primary_key, "MAINT-EXAMPLE");
        // Attribute name keeps its source form
        assert_eq!(obj.attributes[0].name, "Mntner");
    }

    #[test]
    fn test_continuation_lines() {
        let text = "as-set: AS-EXAMPLE\nmembers: AS65536,\n AS65537,\n+AS65538\n";
        let obj = parse(text).unwrap();
        assert_eq!(obj.first("members"), Some("AS65536, AS65537, AS65538"));
    }

    #[test]
    fn test_duplicate_attributes_preserved_in_order() {
        let obj = parse("person: Test Person\nphone: +31 20 000 0000\nphone: +31 20 000 0001\n")
            .unwrap();
        let phones: Vec<&str> = obj
            .attributes
            .iter()
            .filter(|a| a.name == "phone")
            .map(|a| a.value.as_str())
            .collect();
        assert_eq!(phones, vec!["+31 20 000 0000", "+31 20 000 0001"]);
    }

    #[test]
    fn test_leading_blank_lines_and_comments() {
        let obj = parse("\n% generated by publisher\n\nroute: 198.51.100.0/24\n").unwrap();
        assert_eq!(obj.class, "route");
    }

    #[test]
    fn test_blank_line_ends_object() {
        let obj = parse("route: 192.0.2.0/24\n\norigin: AS65536\n").unwrap();
        assert_eq!(obj.attributes.len(), 1);
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(parse(""), Err(RpslError::Empty));
        assert_eq!(parse("\n\n"), Err(RpslError::Empty));
    }

    #[test]
    fn test_not_an_attribute() {
        assert!(matches!(
            parse("this is not rpsl"),
            Err(RpslError::NotAnAttribute(1, _))
        ));
    }

    #[test]
    fn test_dangling_continuation() {
        assert_eq!(
            parse(" continuation first"),
            Err(RpslError::DanglingContinuation(1))
        );
    }

    #[test]
    fn test_empty_primary_key() {
        assert_eq!(parse("route:\norigin: AS65536\n"), Err(RpslError::EmptyPrimaryKey));
    }
}
