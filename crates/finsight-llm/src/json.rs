/// Pull the first JSON object out of an LLM reply.
///
/// Models wrap structured output in markdown fences or prose more often
/// than not; this tolerates both by slicing from the first `{` to the
/// matching last `}` and letting serde validate the result.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    // Fast path: the whole reply is the object.
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_object() {
        let v = extract_json(r#"{"query_type": "complete"}"#).unwrap();
        assert_eq!(v["query_type"], "complete");
    }

    #[test]
    fn fenced_object() {
        let v = extract_json("```json\n{\"confidence\": 0.9}\n```").unwrap();
        assert_eq!(v["confidence"], 0.9);
    }

    #[test]
    fn object_with_surrounding_prose() {
        let v = extract_json("Here is my decision:\n{\"should_reuse\": false}\nLet me know.").unwrap();
        assert_eq!(v["should_reuse"], false);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("no structure here").is_none());
        assert!(extract_json("{broken").is_none());
    }
}
