//! Parsing of free-form agent output.
//!
//! Agents report results as `KEY: value` lines. A `STORIES_JSON:` marker may
//! be followed by a JSON array of stories spanning several lines.

use crate::decode::Context;
use serde::Deserialize;
use std::borrow::Cow;

const STORIES_MARKER: &str = "STORIES_JSON:";

/// A story as produced by a planning agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoryInput {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
}

/// Parsed agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    /// `KEY: value` pairs with lower-cased keys; later lines win.
    pub values: Context,
    /// Stories from a `STORIES_JSON:` block, when present and decodable.
    pub stories: Option<Vec<StoryInput>>,
}

impl ParsedOutput {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Parse raw agent output.
pub fn parse(raw: &str) -> ParsedOutput {
    let (text, stories) = extract_stories(raw);
    ParsedOutput {
        values: parse_key_values(&text),
        stories,
    }
}

/// Parse `KEY: value` lines, splitting on the first colon.
///
/// Keys must be upper-case identifiers (`STATUS`, `VERIFY_FEEDBACK`); other
/// lines are ignored.
pub fn parse_key_values(text: &str) -> Context {
    let mut values = Context::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if is_key(key) {
            values.insert(key.to_lowercase(), value.trim().to_string());
        }
    }
    values
}

fn is_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Split the stories block out of `raw`.
///
/// The block is removed from the returned text whether or not it decodes, so
/// its lines never leak into the context.
fn extract_stories(raw: &str) -> (Cow<'_, str>, Option<Vec<StoryInput>>) {
    let Some(start) = find_marker(raw) else {
        return (Cow::Borrowed(raw), None);
    };
    let after = &raw[start + STORIES_MARKER.len()..];

    let mut stream = serde_json::Deserializer::from_str(after).into_iter::<Vec<StoryInput>>();
    let (consumed, stories) = match stream.next() {
        Some(Ok(stories)) => (stream.byte_offset(), Some(stories)),
        _ => (after.find('\n').unwrap_or(after.len()), None),
    };

    let mut text = String::with_capacity(raw.len());
    text.push_str(&raw[..start]);
    text.push_str(&after[consumed..]);
    (Cow::Owned(text), stories)
}

fn find_marker(raw: &str) -> Option<usize> {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(STORIES_MARKER) {
            return Some(offset + line.len() - trimmed.len());
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let parsed = parse("STATUS: done\nCHANGES: added login: and logout\nnoise line");
        assert_eq!(parsed.get("status"), Some("done"));
        assert_eq!(parsed.get("changes"), Some("added login: and logout"));
        assert_eq!(parsed.values.len(), 2);
    }

    #[test]
    fn later_lines_win() {
        let parsed = parse("STATUS: retry\nSTATUS: done");
        assert_eq!(parsed.get("status"), Some("done"));
    }

    #[test]
    fn ignores_non_key_prefixes() {
        let parsed = parse("see https://example.com\n  Note: lowercase\nISSUES:  trimmed  ");
        assert_eq!(parsed.get("issues"), Some("trimmed"));
        assert_eq!(parsed.values.len(), 1);
    }

    #[test]
    fn extracts_multiline_stories() {
        let raw = "STATUS: done\nSTORIES_JSON: [\n  {\"id\": \"US-1\", \"title\": \"Login\", \"acceptanceCriteria\": [\"works\"]},\n  {\"id\": \"US-2\", \"title\": \"Logout\"}\n]\nREPO: /tmp/app";
        let parsed = parse(raw);
        let stories = parsed.stories.clone().unwrap();
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].id, "US-1");
        assert_eq!(stories[0].acceptance_criteria, vec!["works".to_string()]);
        assert_eq!(parsed.get("repo"), Some("/tmp/app"));
        assert!(parsed.get("stories_json").is_none());
    }

    #[test]
    fn malformed_stories_are_dropped() {
        let parsed = parse("STORIES_JSON: [{broken\nSTATUS: done");
        assert!(parsed.stories.is_none());
        assert!(parsed.get("stories_json").is_none());
        assert_eq!(parsed.get("status"), Some("done"));
    }
}
