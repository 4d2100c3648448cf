//! Value extraction: turning a parser payload into the record a callback
//! receives.
//!
//! Tracked values are a tagged list.  A plain string retains the payload item
//! with that exact key; for incremental requests only, a string that is not a
//! payload key falls back to matching literal line text, retaining any string
//! value containing it.  A regex with one capture group harvests
//! every match from the payload's string values under a mandatory label; a
//! regex with two capture groups harvests (label, value) pairs.  Entries are
//! applied in list order and later labels win on collision.

use crate::parser::Payload;
use regex::Regex;
use serde_json::Value;

/// One entry of a request's tracked-values list.
#[derive(Debug, Clone)]
pub enum Tracked {
    /// Exact payload key, or (for tailing) literal text to find in a line.
    Key(String),
    /// Regex with a single capture group; each match contributes the captured
    /// text as a value.  Requires a label.
    Capture(Regex),
    /// Regex with two capture groups; the first names the value, the second
    /// is the value itself.
    LabeledCapture(Regex),
}

impl Tracked {
    /// Tracked entry for an exact key or literal line text.
    pub fn key(name: impl Into<String>) -> Tracked {
        Tracked::Key(name.into())
    }

    /// Tracked entry for a compiled pattern; the variant is chosen from the
    /// number of capture groups.  Patterns with zero or more than two groups
    /// are rejected during request validation.
    #[must_use]
    pub fn pattern(regex: Regex) -> Tracked {
        if regex.captures_len() == 3 {
            Tracked::LabeledCapture(regex)
        } else {
            Tracked::Capture(regex)
        }
    }

    /// Number of capture groups, not counting the implicit whole-match group.
    pub(crate) fn capture_groups(&self) -> Option<usize> {
        match self {
            Tracked::Key(_) => None,
            Tracked::Capture(regex) | Tracked::LabeledCapture(regex) => {
                Some(regex.captures_len() - 1)
            }
        }
    }
}

/// A pattern used to drop complete lines before delta parsing.
#[derive(Debug, Clone)]
pub enum SkipPattern {
    /// Drop lines equal to this text.
    Text(String),
    /// Drop lines the regex matches.
    Matches(Regex),
}

impl SkipPattern {
    pub(crate) fn is_match(&self, line: &str) -> bool {
        match self {
            SkipPattern::Text(text) => line == text,
            SkipPattern::Matches(regex) => regex.is_match(line),
        }
    }
}

/// Collapse nested mappings into a single level, joining keys with `.`.
/// Sequence values are preserved as-is.  Already-flat payloads come back
/// unchanged.
#[must_use]
pub fn flatten(payload: &Payload) -> Payload {
    let mut flat = Payload::new();
    flatten_into(&mut flat, "", payload);
    flat
}

fn flatten_into(out: &mut Payload, prefix: &str, payload: &Payload) {
    for (key, value) in payload {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(out, &name, nested),
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

/// Apply a request's tracked-values filter to one parser payload.
///
/// Returns `None` when nothing survives; such records are dropped without a
/// callback invocation.  With an empty filter the payload is passed through
/// (flattened when requested).  `literal_lines` enables the raw-line fallback
/// for string entries; it is set for incremental requests only, so a snapshot
/// string entry with no matching key contributes nothing.
#[must_use]
pub fn extract(
    payload: &Payload,
    tracked: &[(Tracked, Option<String>)],
    flatten_data: bool,
    literal_lines: bool,
) -> Option<Payload> {
    let flattened;
    let payload = if flatten_data {
        flattened = flatten(payload);
        &flattened
    } else {
        payload
    };

    if tracked.is_empty() {
        return if payload.is_empty() {
            None
        } else {
            Some(payload.clone())
        };
    }

    let mut record = Payload::new();
    for (entry, label) in tracked {
        match entry {
            Tracked::Key(key) => {
                if let Some(value) = payload.get(key) {
                    let name = label.as_deref().unwrap_or(key);
                    record.insert(name.to_owned(), value.clone());
                } else if literal_lines {
                    // Literal text: match against string values (tailed lines).
                    for value in payload.values() {
                        if let Value::String(text) = value {
                            if text.contains(key) {
                                let name = label.as_deref().unwrap_or(key);
                                record.insert(name.to_owned(), value.clone());
                            }
                        }
                    }
                }
            }
            Tracked::Capture(regex) => {
                let Some(label) = label.as_deref() else {
                    continue;
                };
                let mut captured = Vec::new();
                for value in payload.values() {
                    if let Value::String(text) = value {
                        for found in regex.captures_iter(text) {
                            if let Some(group) = found.get(1) {
                                captured.push(group.as_str().to_owned());
                            }
                        }
                    }
                }
                if captured.len() == 1 {
                    record.insert(label.to_owned(), Value::String(captured.remove(0)));
                } else {
                    for (index, text) in captured.into_iter().enumerate() {
                        record.insert(format!("{label}_{index}"), Value::String(text));
                    }
                }
            }
            Tracked::LabeledCapture(regex) => {
                for value in payload.values() {
                    if let Value::String(text) = value {
                        for found in regex.captures_iter(text) {
                            let (Some(name), Some(group)) = (found.get(1), found.get(2)) else {
                                continue;
                            };
                            let name = label.as_deref().unwrap_or(name.as_str());
                            record.insert(name.to_owned(), Value::String(group.as_str().to_owned()));
                        }
                    }
                }
            }
        }
    }

    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn exact_key_filter() {
        let data = payload(&[("x", Value::from(1)), ("y", Value::from(2))]);
        let record = extract(&data, &[(Tracked::key("x"), None)], false, false).unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["x"], Value::from(1));
    }

    #[test]
    fn snapshot_strings_never_match_substrings() {
        // Without the literal-line fallback an absent key contributes
        // nothing, even when a string value happens to contain the text.
        let data = payload(&[("status", Value::from("xylophone"))]);
        assert!(extract(&data, &[(Tracked::key("x"), None)], false, false).is_none());
    }

    #[test]
    fn missing_filter_passes_payload_through() {
        let data = payload(&[("x", Value::from(1))]);
        assert_eq!(extract(&data, &[], false, false).unwrap(), data);
        assert!(extract(&Payload::new(), &[], false, false).is_none());
    }

    #[test]
    fn single_capture_suffixes_multiple_matches() {
        let data = payload(&[("message", Value::from("v=1 v=2 v=3"))]);
        let tracked = vec![(
            Tracked::pattern(Regex::new(r"v=(\d+)").unwrap()),
            Some("val".to_owned()),
        )];
        let record = extract(&data, &tracked, false, true).unwrap();
        assert_eq!(record["val_0"], Value::from("1"));
        assert_eq!(record["val_1"], Value::from("2"));
        assert_eq!(record["val_2"], Value::from("3"));

        let data = payload(&[("message", Value::from("v=9"))]);
        let record = extract(&data, &tracked, false, true).unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["val"], Value::from("9"));
    }

    #[test]
    fn two_captures_name_the_value() {
        let data = payload(&[("message", Value::from("alpha=1"))]);
        let tracked = vec![(
            Tracked::pattern(Regex::new(r"(\w+)=(\d+)").unwrap()),
            None,
        )];
        let record = extract(&data, &tracked, false, true).unwrap();
        assert_eq!(record["alpha"], Value::from("1"));

        // A positional label overrides the captured one.
        let tracked = vec![(
            Tracked::pattern(Regex::new(r"(\w+)=(\d+)").unwrap()),
            Some("named".to_owned()),
        )];
        let record = extract(&data, &tracked, false, true).unwrap();
        assert_eq!(record["named"], Value::from("1"));
    }

    #[test]
    fn literal_text_matches_lines() {
        let data = payload(&[("message", Value::from("epoch complete"))]);
        let tracked = vec![(Tracked::key("complete"), Some("done".to_owned()))];
        let record = extract(&data, &tracked, false, true).unwrap();
        assert_eq!(record["done"], Value::from("epoch complete"));
    }

    #[test]
    fn unmatched_filter_drops_the_record() {
        let data = payload(&[("message", Value::from("nothing here"))]);
        let tracked = vec![(
            Tracked::pattern(Regex::new(r"v=(\d+)").unwrap()),
            Some("val".to_owned()),
        )];
        assert!(extract(&data, &tracked, false, true).is_none());
    }

    #[test]
    fn later_entries_win_on_label_collision() {
        let data = payload(&[("a", Value::from(1)), ("b", Value::from(2))]);
        let tracked = vec![
            (Tracked::key("a"), Some("out".to_owned())),
            (Tracked::key("b"), Some("out".to_owned())),
        ];
        let record = extract(&data, &tracked, false, false).unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["out"], Value::from(2));
    }

    #[test]
    fn flatten_joins_nested_keys() {
        let mut inner = Payload::new();
        inner.insert("loss".into(), Value::from(0.5));
        let data = payload(&[
            ("train", Value::Object(inner)),
            ("steps", Value::from(vec![1, 2])),
        ]);
        let flat = flatten(&data);
        assert_eq!(flat["train.loss"], Value::from(0.5));
        // Sequences are preserved, not flattened.
        assert_eq!(flat["steps"], Value::from(vec![1, 2]));

        // Flattening an already-flat payload is a no-op.
        assert_eq!(flatten(&flat), flat);
    }

    #[test]
    fn extract_flattens_on_request() {
        let mut inner = Payload::new();
        inner.insert("loss".into(), Value::from(0.25));
        let data = payload(&[("train", Value::Object(inner))]);
        let record = extract(&data, &[(Tracked::key("train.loss"), None)], true, false).unwrap();
        assert_eq!(record["train.loss"], Value::from(0.25));
    }
}
