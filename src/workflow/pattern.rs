//! Artifact Patterns and Wildcard Bindings
//!
//! An [`ArtifactPattern`] is a relative path containing `{name}` wildcards,
//! e.g. `{sample}/00_raw/{sample}_R{read}.fastq.gz`. Patterns are parsed once
//! into literal and wildcard segments; they can be
//! - substituted with a [`WildcardBinding`] to yield a concrete path, or
//! - matched against a concrete path to recover the binding.
//!
//! A wildcard value is never empty and never contains `/`, and a wildcard
//! used twice in a pattern must take the same value both times.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Wildcard holding the sample identifier.
pub const SAMPLE: &str = "sample";

/// Wildcard holding the read side (`1` or `2`).
pub const READ: &str = "read";

/// Concrete values for a template's free variables.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WildcardBinding(BTreeMap<String, String>);

impl WildcardBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binding for a per-sample stage.
    pub fn for_sample(sample: &str) -> Self {
        Self::new().with(SAMPLE, sample)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn sample(&self) -> Option<&str> {
        self.get(SAMPLE)
    }

    pub fn read(&self) -> Option<&str> {
        self.get(READ)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WildcardBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard(String),
}

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPattern {
    text: String,
    segments: Vec<Segment>,
}

impl ArtifactPattern {
    /// Parses a pattern; an unclosed `{` is kept as literal text.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = parse_segments(&text);
        Self { text, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Wildcard(_)))
    }

    /// Wildcard names in order of first appearance.
    pub fn wildcard_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Wildcard(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitutes every wildcard, or returns the first unbound name.
    pub fn substitute(&self, binding: &WildcardBinding) -> Result<String, String> {
        let mut out = String::with_capacity(self.text.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Wildcard(name) => match binding.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }

    /// Matches a concrete path, returning the binding it implies.
    ///
    /// `accept(name, value)` restricts the values a wildcard may take; the
    /// first binding (shortest values first) satisfying it is returned.
    pub fn matches<F>(&self, path: &str, accept: F) -> Option<WildcardBinding>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut bound = BTreeMap::new();
        if self.match_from(0, path, &mut bound, &accept) {
            Some(WildcardBinding(bound))
        } else {
            None
        }
    }

    fn match_from<F>(
        &self,
        index: usize,
        rest: &str,
        bound: &mut BTreeMap<String, String>,
        accept: &F,
    ) -> bool
    where
        F: Fn(&str, &str) -> bool,
    {
        let Some(segment) = self.segments.get(index) else {
            return rest.is_empty();
        };

        match segment {
            Segment::Literal(lit) => rest
                .strip_prefix(lit.as_str())
                .map_or(false, |r| self.match_from(index + 1, r, bound, accept)),
            Segment::Wildcard(name) => {
                if let Some(value) = bound.get(name).cloned() {
                    return rest
                        .strip_prefix(value.as_str())
                        .map_or(false, |r| self.match_from(index + 1, r, bound, accept));
                }

                let limit = rest.find('/').unwrap_or(rest.len());
                let ends: Vec<usize> = rest[..limit]
                    .char_indices()
                    .map(|(i, c)| i + c.len_utf8())
                    .collect();

                for end in ends {
                    let value = &rest[..end];
                    if !accept(name, value) {
                        continue;
                    }
                    bound.insert(name.clone(), value.to_string());
                    if self.match_from(index + 1, &rest[end..], bound, accept) {
                        return true;
                    }
                    bound.remove(name);
                }
                false
            }
        }
    }
}

impl fmt::Display for ArtifactPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for ArtifactPattern {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Splits pattern text into literal and wildcard segments.
fn parse_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            literal.push_str(&rest[..open + 1]);
            rest = after;
            continue;
        }

        literal.push_str(&rest[..open]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Wildcard(name.to_string()));
        rest = &after[close + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}
