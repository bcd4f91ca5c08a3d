//! Textual glue rules.
//!
//! Users may attach rules (file `glue.rules` at the storage root) that
//! suppress glue generation for offending tileset combinations:
//!
//! ```text
//! # at most one member may carry the tag
//! unique-tag(provider-a)
//! # all matching tags across members must be the same tag
//! unique-tag-match(year.*)
//! ```

use crate::error::{Result, TileStoreError};

use super::config::StoredTileset;

/// One parsed glue rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlueRule {
    /// The tag must appear in at most one tileset of the glue.
    UniqueTag(String),
    /// All tags matching the glob must be one and the same tag.
    UniqueTagMatch(String),
}

/// Parse a rules document: `name(argument)` entries, `#` comments,
/// arbitrary whitespace.
pub fn parse_rules(text: &str) -> Result<Vec<GlueRule>> {
    let mut rules = Vec::new();
    for (line_number, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let (name, rest) = line.split_once('(').ok_or_else(|| {
            TileStoreError::Format(format!(
                "glue rule syntax error on line {}: {raw:?}",
                line_number + 1
            ))
        })?;
        let argument = rest.strip_suffix(')').ok_or_else(|| {
            TileStoreError::Format(format!(
                "glue rule syntax error on line {}: {raw:?}",
                line_number + 1
            ))
        })?;
        if argument.is_empty()
            || !argument
                .chars()
                .all(|c| c.is_alphanumeric() || "-._*?".contains(c))
        {
            return Err(TileStoreError::Format(format!(
                "invalid glue rule argument on line {}: {argument:?}",
                line_number + 1
            )));
        }

        match name.trim() {
            "unique-tag" => rules.push(GlueRule::UniqueTag(argument.to_string())),
            "unique-tag-match" => rules.push(GlueRule::UniqueTagMatch(argument.to_string())),
            other => {
                return Err(TileStoreError::Format(format!(
                    "unknown glue rule {other:?} on line {}",
                    line_number + 1
                )))
            }
        }
    }
    Ok(rules)
}

enum Matcher<'a> {
    UniqueTag { tag: &'a str, count: usize },
    UniqueTagMatch { pattern: &'a str, matched: Option<String> },
}

impl Matcher<'_> {
    fn check(&mut self, tileset: &StoredTileset) -> bool {
        match self {
            Matcher::UniqueTag { tag, count } => {
                *count += tileset.tags.contains(*tag) as usize;
                *count < 2
            }
            Matcher::UniqueTagMatch { pattern, matched } => {
                for tag in &tileset.tags {
                    if !glob_match(pattern, tag) {
                        continue;
                    }
                    match matched {
                        None => *matched = Some(tag.clone()),
                        Some(previous) if previous != tag => return false,
                        Some(_) => {}
                    }
                }
                true
            }
        }
    }
}

/// Stateful checker over one glue's member list.
pub struct GlueRuleChecker<'a> {
    matchers: Vec<Matcher<'a>>,
}

impl<'a> GlueRuleChecker<'a> {
    pub fn new(rules: &'a [GlueRule]) -> Self {
        GlueRuleChecker {
            matchers: rules
                .iter()
                .map(|rule| match rule {
                    GlueRule::UniqueTag(tag) => Matcher::UniqueTag { tag, count: 0 },
                    GlueRule::UniqueTagMatch(pattern) => Matcher::UniqueTagMatch {
                        pattern,
                        matched: None,
                    },
                })
                .collect(),
        }
    }

    /// Feed one member; `false` means the glue is suppressed.
    pub fn check(&mut self, tileset: &StoredTileset) -> bool {
        self.matchers.iter_mut().all(|m| m.check(tileset))
    }
}

/// Whether all members together pass the rules.
pub fn check(rules: &[GlueRule], tilesets: &[&StoredTileset]) -> bool {
    let mut checker = GlueRuleChecker::new(rules);
    tilesets.iter().all(|ts| checker.check(ts))
}

/// Glob match with `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pattern[1..], text)
                    || (!text.is_empty() && matches(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => matches(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => matches(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches(&pattern, &text)
}
