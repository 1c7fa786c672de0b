//! Model- and brand-name rewriting on relayed responses.
//!
//! Each configured pair rewrites case-insensitively and literally; regex
//! metacharacters in the source string are escaped. Pairs whose replacement
//! still contains the source are dropped: applying such a pair twice would
//! keep growing the text, and the rewrite must be idempotent.

use regex::{NoExpand, Regex, RegexBuilder};
use serde_json::Value;
use tracing::warn;

pub struct Rewriter {
    patterns: Vec<(Regex, String)>,
}

impl Rewriter {
    pub fn new(pairs: &[(String, String)]) -> Self {
        let mut patterns = Vec::with_capacity(pairs.len());
        for (from, to) in pairs {
            if from.is_empty() || from == to {
                continue;
            }
            if to.to_lowercase().contains(&from.to_lowercase()) {
                warn!(%from, %to, "rewrite pair is not idempotent, skipping");
                continue;
            }
            match RegexBuilder::new(&regex::escape(from))
                .case_insensitive(true)
                .build()
            {
                Ok(re) => patterns.push((re, to.clone())),
                Err(e) => warn!(%from, "failed to compile rewrite pattern: {e}"),
            }
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn rewrite_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (re, to) in &self.patterns {
            out = re.replace_all(&out, NoExpand(to)).into_owned();
        }
        out
    }

    /// Rewrite every string value in a parsed JSON tree.
    pub fn rewrite_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.rewrite_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.rewrite_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.rewrite_value(v)),
            _ => {}
        }
    }

    /// Rewrite one SSE chunk. `data:` payloads that parse as JSON get the
    /// structured rewrite; everything else (`[DONE]`, partial frames,
    /// comments) gets the raw replacement.
    pub fn rewrite_chunk(&self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for segment in chunk.split_inclusive('\n') {
            let (line, newline) = match segment.strip_suffix('\n') {
                Some(line) => (line, "\n"),
                None => (segment, ""),
            };
            if let Some(payload) = line.strip_prefix("data: ") {
                match serde_json::from_str::<Value>(payload) {
                    Ok(mut event) => {
                        self.rewrite_value(&mut event);
                        out.push_str("data: ");
                        out.push_str(
                            &serde_json::to_string(&event)
                                .unwrap_or_else(|_| payload.to_string()),
                        );
                    }
                    Err(_) => out.push_str(&self.rewrite_str(line)),
                }
            } else {
                out.push_str(&self.rewrite_str(line));
            }
            out.push_str(newline);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewriter() -> Rewriter {
        Rewriter::new(&[
            ("m-x".into(), "Display".into()),
            ("Claude Code".into(), "Claude Opus".into()),
        ])
    }

    #[test]
    fn replacement_is_case_insensitive_and_literal() {
        let r = rewriter();
        assert_eq!(r.rewrite_str("model M-X done"), "model Display done");
        assert_eq!(r.rewrite_str("claude code says"), "Claude Opus says");
    }

    #[test]
    fn metacharacters_in_source_are_escaped() {
        let r = Rewriter::new(&[("m.v1(x)".into(), "D".into())]);
        assert_eq!(r.rewrite_str("got m.v1(x) here"), "got D here");
        // A real dot pattern would have matched this too.
        assert_eq!(r.rewrite_str("mAv1(x)"), "mAv1(x)");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let r = rewriter();
        let input = r#"{"model":"m-x","note":"Claude Code was here"}"#;
        let once = r.rewrite_str(input);
        assert_eq!(r.rewrite_str(&once), once);
    }

    #[test]
    fn self_growing_pairs_are_dropped() {
        let r = Rewriter::new(&[("claude".into(), "claude-3".into())]);
        assert!(r.is_empty());
        assert_eq!(r.rewrite_str("claude"), "claude");
    }

    #[test]
    fn deep_value_rewrite() {
        let r = rewriter();
        let mut value = json!({
            "model": "m-x",
            "choices": [{"message": {"content": "made by Claude Code on m-x"}}],
            "n": 3
        });
        r.rewrite_value(&mut value);
        assert_eq!(value["model"], "Display");
        assert_eq!(
            value["choices"][0]["message"]["content"],
            "made by Claude Opus on Display"
        );
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn chunk_rewrites_json_payloads_structurally() {
        let r = rewriter();
        let chunk = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"m-x\"}}\n\n";
        let out = r.rewrite_chunk(chunk);
        assert!(out.contains("\"model\":\"Display\""));
        assert!(out.starts_with("event: message_start\n"));
        assert!(out.ends_with("\n\n"));
    }

    #[test]
    fn chunk_falls_back_to_raw_replacement() {
        let r = rewriter();
        assert_eq!(r.rewrite_chunk("data: [DONE]\n\n"), "data: [DONE]\n\n");
        // Unparseable payload mentioning the model still gets rewritten.
        assert_eq!(
            r.rewrite_chunk("data: not-json m-x\n"),
            "data: not-json Display\n"
        );
    }

    #[test]
    fn chunk_without_trailing_newline_keeps_shape() {
        let r = rewriter();
        assert_eq!(r.rewrite_chunk("data: tail m-x"), "data: tail Display");
    }
}
