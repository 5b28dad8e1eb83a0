//! JSON extraction for model replies.
//!
//! Vision models wrap their verdicts in markdown fences or surround them
//! with commentary. The extraction tries, in order:
//! 1. A ```json fenced block
//! 2. Any fenced block containing an object
//! 3. The whole reply when it starts with '{'
//! 4. The largest valid object anywhere, preferring later ones

use regex::Regex;
use thiserror::Error;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces")]
    Truncated { unclosed_braces: usize },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Extracts the JSON object a reply carries.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    for candidate in [
        extract_from_code_block(trimmed, r"```json\s*\n?([\s\S]*?)\n?```"),
        extract_from_code_block(trimmed, r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```"),
    ]
    .into_iter()
    .flatten()
    {
        if is_valid(&candidate) {
            return Ok(candidate);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            let candidate = &trimmed[..=end];
            if is_valid(candidate) {
                return Ok(candidate.to_string());
            }
        }
    }

    if let Some(json) = extract_last_valid_json_object(trimmed) {
        return Ok(json);
    }

    let unclosed = unclosed_braces(trimmed);
    if unclosed > 0 {
        return Err(JsonExtractionError::Truncated {
            unclosed_braces: unclosed,
        });
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(60).collect(),
    })
}

/// Index of the brace closing the object `s` starts with.
///
/// Braces inside string literals, including escaped quotes, are ignored.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn extract_from_code_block(content: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let block = re.captures(content)?.get(1)?.as_str().trim();
    let start = block.find('{')?;
    let end = find_matching_brace(&block[start..])?;
    Some(block[start..=start + end].to_string())
}

/// The largest valid object; ties go to the later one.
fn extract_last_valid_json_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_brace(&content[start..])?;
            let candidate = &content[start..=start + end];
            is_valid(candidate).then(|| (start, candidate.to_string()))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json)
}

fn unclosed_braces(content: &str) -> usize {
    let Some(start) = content.find('{') else {
        return 0;
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    for c in content[start..].chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

fn is_valid(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let reply = "Here you go:\n```json\n{\"score\": 0.8}\n```\nThanks";
        assert_eq!(extract_json_object(reply).unwrap(), "{\"score\": 0.8}");
    }

    #[test]
    fn test_bare_object_with_braces_in_strings() {
        let reply = r#"{"caption": "a {curly} hat", "score": 0.5}"#;
        assert_eq!(extract_json_object(reply).unwrap(), reply);
    }

    #[test]
    fn test_object_after_commentary() {
        let reply = r#"Looking at {this}... final: {"score": 0.3, "issues": ["blur"]}"#;
        assert_eq!(
            extract_json_object(reply).unwrap(),
            r#"{"score": 0.3, "issues": ["blur"]}"#
        );
    }

    #[test]
    fn test_truncated_and_missing() {
        assert_eq!(
            extract_json_object(r#"{"score": 0.3, "issues": ["#),
            Err(JsonExtractionError::Truncated { unclosed_braces: 1 })
        );
        assert!(matches!(
            extract_json_object("no verdict"),
            Err(JsonExtractionError::NotFound { .. })
        ));
    }
}
