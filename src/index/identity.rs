//! Stable unit identities.
//!
//! An [`Identity`] is derived once, at discovery time, and then threaded
//! through chunks, results, cache keys and merge ordering. Nothing downstream
//! re-derives it from file names.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Check that a key segment is safe to use as a single path component.
pub(crate) fn validate_segment(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value == "." || value == ".." {
        return Err(format!("'{}' is not a valid name", value));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("'{}' contains unsupported character {:?}", value, c));
    }
    Ok(())
}

/// Identity of one input unit (typically one chromosome).
///
/// Ordering is the canonical merge order: natural ordering where digit runs
/// compare numerically and sort before letters, so `chr2 < chr10 < chrX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        validate_segment(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        natural_cmp(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Number(&'a str),
    Text(&'a str),
}

fn segments(s: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut digit_run: Option<bool> = None;

    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        match digit_run {
            Some(prev) if prev != is_digit => {
                out.push(make_segment(&s[start..i], prev));
                start = i;
            }
            _ => {}
        }
        digit_run = Some(is_digit);
    }
    if let Some(prev) = digit_run {
        out.push(make_segment(&s[start..], prev));
    }
    out
}

fn make_segment(s: &str, is_digit: bool) -> Segment<'_> {
    if is_digit {
        Segment::Number(s)
    } else {
        Segment::Text(s)
    }
}

fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);

    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x, y) {
            (Segment::Number(x), Segment::Number(y)) => compare_numbers(x, y),
            (Segment::Number(_), Segment::Text(_)) => Ordering::Less,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Greater,
            (Segment::Text(x), Segment::Text(y)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<Identity> {
        names.iter().map(|n| Identity::new(*n).unwrap()).collect()
    }

    #[test]
    fn test_canonical_chromosome_order() {
        let mut units = ids(&["chrX", "chr10", "chr2", "chr1", "chr22", "chrY"]);
        units.sort();
        let names: Vec<_> = units.iter().map(|i| i.as_str()).collect();
        assert_eq!(names, vec!["chr1", "chr2", "chr10", "chr22", "chrX", "chrY"]);
    }

    #[test]
    fn test_plain_numbers_and_prefixes() {
        let mut units = ids(&["12", "3", "X", "1"]);
        units.sort();
        let names: Vec<_> = units.iter().map(|i| i.as_str()).collect();
        assert_eq!(names, vec!["1", "3", "12", "X"]);
    }

    #[test]
    fn test_leading_zeros_are_distinct_but_adjacent() {
        let a = Identity::new("chr01").unwrap();
        let b = Identity::new("chr1").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
        assert!(Identity::new("chr2").unwrap() > a);
    }

    #[test]
    fn test_rejects_unsafe_values() {
        assert!(Identity::new("").is_err());
        assert!(Identity::new("..").is_err());
        assert!(Identity::new("chr1/../x").is_err());
        assert!(Identity::new("chr 1").is_err());
        assert!(Identity::new("chr1.dose").is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let id: Identity = serde_json::from_str("\"chr7\"").unwrap();
        assert_eq!(id.as_str(), "chr7");
        assert!(serde_json::from_str::<Identity>("\"a/b\"").is_err());
    }
}
