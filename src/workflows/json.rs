use serde_json::{Map, Value};
use tracing::debug;

/// Pull a single JSON object out of model output.
///
/// Accepts a fenced code block (with or without a `json` tag), a bare object,
/// or an object surrounded by prose. Anything that is not an object is `None`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let candidate = fenced_block(text).unwrap_or(text).trim();
    if let Some(obj) = parse_object(candidate) {
        return Some(obj);
    }

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end <= start {
        return None;
    }
    let obj = parse_object(&candidate[start..=end]);
    if obj.is_none() {
        debug!(len = text.len(), "model output holds no parseable JSON object");
    }
    obj
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let rest = &text[open + 3..];
    let body_start = rest.find('\n').map_or(0, |i| i + 1);
    let tag = rest[..body_start].trim();
    let body = if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
        &rest[body_start..]
    } else {
        rest
    };
    let close = body.find("```")?;
    Some(&body[..close])
}

fn parse_object(s: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_object() {
        let obj = extract_json_object(r#"  {"exposition": "text"} "#).unwrap();
        assert_eq!(obj["exposition"], json!("text"));
    }

    #[test]
    fn fenced_json_block() {
        let text = "Here you go:\n```json\n{\"intent\": \"chatting\"}\n```\nAnything else?";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["intent"], json!("chatting"));
    }

    #[test]
    fn untagged_fence() {
        let obj = extract_json_object("```\n{\"score\": 1.0}\n```").unwrap();
        assert_eq!(obj["score"], json!(1.0));
    }

    #[test]
    fn object_inside_prose() {
        let obj = extract_json_object("Sure! {\"a\": {\"b\": 2}} Hope it helps.").unwrap();
        assert_eq!(obj["a"]["b"], json!(2));
    }

    #[test]
    fn rejects_arrays_and_garbage() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{ broken").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }
}
