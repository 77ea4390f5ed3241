//! Recovers the JSON payload from a model completion.
//!
//! Models are told to answer with bare JSON but regularly wrap it in markdown
//! fences or surround it with conversational prose. The normalizer strips the
//! wrapping and locates the payload boundaries; it does not attempt to repair
//! malformed JSON.

use crate::error::{IngestError, Result};
use crate::utils::truncate_chars;
use log::{debug, warn};
use serde_json::Value;

const FENCE: &str = "```";

/// Characters of cleaned output carried by `UnparsableModelOutput`.
pub const DIAGNOSTIC_SNIPPET_CHARS: usize = 500;

/// Removes markdown code fences and a leading language tag.
///
/// A fence at the very start (and its matching fence at the end) is removed in
/// place. A fenced block embedded in prose is returned on its own when it
/// contains something that looks like JSON.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix(FENCE) {
        text = drop_language_tag(rest);
    } else if let Some(body) = embedded_fenced_block(text) {
        return body.trim();
    }

    if let Some(rest) = text.trim_end().strip_suffix(FENCE) {
        text = rest;
    }

    text.trim()
}

/// Returns the substring believed to hold a single JSON value.
///
/// The payload starts at the first `[`, or at the first `{` when there is no
/// array or when that object encloses the array. Only the value opened there
/// is considered: a truncated completion never yields one of its inner values.
pub fn extract_json_payload(raw: &str) -> &str {
    let text = strip_code_fences(raw);
    let Some(start) = payload_start(text) else {
        return text;
    };

    let payload = matching_close(text, start)
        .map(|end| &text[start..=end])
        .filter(|candidate| serde_json::from_str::<Value>(candidate).is_ok())
        .unwrap_or_else(|| slice_to_last_close(text, start));
    log_discarded(text, payload);
    payload
}

/// Normalizes and parses a completion. Failure is terminal for the document.
pub fn parse_model_output(raw: &str) -> Result<Value> {
    let payload = extract_json_payload(raw);

    serde_json::from_str(payload).map_err(|e| {
        warn!("Model output could not be parsed as JSON: {}", e);
        IngestError::UnparsableModelOutput {
            reason: e.to_string(),
            snippet: truncate_chars(payload, DIAGNOSTIC_SNIPPET_CHARS),
        }
    })
}

fn drop_language_tag(text: &str) -> &str {
    let tag_len = text
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(text.len());
    &text[tag_len..]
}

fn embedded_fenced_block(text: &str) -> Option<&str> {
    let open = text.find(FENCE)?;
    let body = drop_language_tag(&text[open + FENCE.len()..]);
    let close = body.find(FENCE).unwrap_or(body.len());
    let body = &body[..close];

    if body.contains('[') || body.contains('{') {
        Some(body)
    } else {
        None
    }
}

fn payload_start(text: &str) -> Option<usize> {
    match (text.find('['), text.find('{')) {
        (Some(array), Some(object)) if object < array => match matching_close(text, object) {
            Some(end) if end < array => Some(array),
            _ => Some(object),
        },
        (Some(array), _) => Some(array),
        (None, object) => object,
    }
}

/// From `start` through the last `]` or `}`.
fn slice_to_last_close(text: &str, start: usize) -> &str {
    let end = match (text.rfind(']'), text.rfind('}')) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    match end {
        Some(e) if e >= start => &text[start..=e],
        _ => &text[start..],
    }
}

/// String-aware bracket matching. Only ASCII bytes are inspected, which never
/// occur inside multi-byte UTF-8 sequences, so the returned index is a valid
/// char boundary.
fn matching_close(text: &str, start: usize) -> Option<usize> {
    let mut expected = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'[' => expected.push(b']'),
            b'{' => expected.push(b'}'),
            b']' | b'}' => {
                if expected.pop() != Some(*byte) {
                    return None;
                }
                if expected.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

fn log_discarded(text: &str, payload: &str) {
    let offset = payload.as_ptr() as usize - text.as_ptr() as usize;
    let trailing = text.len() - offset - payload.len();
    if offset > 0 {
        debug!("Discarded {} chars of preamble before JSON", offset);
    }
    if trailing > 0 {
        debug!("Discarded {} chars of trailing text after JSON", trailing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block_with_prose() {
        let raw = "Aqui está o JSON solicitado:\n```json\n[{\"competency\": \"09/2025\"}]\n```\nEspero que ajude!";
        assert_eq!(
            extract_json_payload(raw),
            "[{\"competency\": \"09/2025\"}]"
        );
    }

    #[test]
    fn test_leading_fence_without_tag() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_payload(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_bare_json_is_untouched() {
        let raw = "[{\"a\": [1, 2]}, {\"b\": {\"c\": null}}]";
        assert_eq!(extract_json_payload(raw), raw);
    }

    #[test]
    fn test_object_containing_array_is_not_split() {
        let raw = "Result: {\"expenses\": [{\"amount\": 1}], \"total\": 1} done";
        assert_eq!(
            extract_json_payload(raw),
            "{\"expenses\": [{\"amount\": 1}], \"total\": 1}"
        );
    }

    #[test]
    fn test_brackets_inside_strings() {
        let raw = "ok: {\"description\": \"Obra [616] } fase\", \"amount\": 2}";
        let value = parse_model_output(raw).unwrap();
        assert_eq!(value["description"], "Obra [616] } fase");
    }

    #[test]
    fn test_prose_after_trailing_fence() {
        let raw = "```json\n{\"a\": 1}\n```\nLet me know if you need anything else.";
        assert_eq!(extract_json_payload(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_truncated_output_is_unparsable() {
        let raw = "```json\n[{\"competency\": \"09/2025\", \"expenses\": [";
        let err = parse_model_output(raw).unwrap_err();
        match err {
            IngestError::UnparsableModelOutput { snippet, .. } => {
                assert!(snippet.starts_with("[{\"competency\""));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_array_preferred_over_earlier_object() {
        let raw = "Campos {} conforme pedido: [{\"a\": 1}]";
        assert_eq!(extract_json_payload(raw), "[{\"a\": 1}]");
    }

    #[test]
    fn test_truncated_array_does_not_yield_its_first_record() {
        let raw = "```json\n[{\"competency\": \"09/2025\", \"project_code\": \"603\"}, \
                   {\"competency\": \"09/2025\", \"project_code\": \"604\", \"expenses\": [{\"amount\": 9";
        let err = parse_model_output(raw).unwrap_err();
        assert_eq!(err.kind(), "unparsable_model_output");
    }

    #[test]
    fn test_truncated_object_does_not_yield_inner_array() {
        let raw = "{\"competency\": \"09/2025\", \"expenses\": [{\"amount\": 9}], \"revenues\": [";
        let err = parse_model_output(raw).unwrap_err();
        match err {
            IngestError::UnparsableModelOutput { snippet, .. } => {
                assert!(snippet.starts_with("{\"competency\""));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_diagnostic_snippet_is_bounded() {
        let raw = format!("[{}", "x".repeat(2000));
        match parse_model_output(&raw).unwrap_err() {
            IngestError::UnparsableModelOutput { snippet, .. } => {
                assert_eq!(snippet.chars().count(), DIAGNOSTIC_SNIPPET_CHARS);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_json_at_all() {
        let err = parse_model_output("I could not read the document.").unwrap_err();
        assert_eq!(err.kind(), "unparsable_model_output");
    }
}
