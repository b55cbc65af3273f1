//! Rewriter for upstream "thinking" fragments. The upstream wraps its
//! reasoning in HTML-ish `<details>`/`<summary>` markup and quote prefixes;
//! clients expect either `<think>` tags or plain text.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ThinkTagsMode;

static SUMMARY_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<summary>.*?</summary>").expect("summary regex"));

static DETAILS_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<details[^>]*>").expect("details regex"));

/// Rewrite one thinking fragment. The result may be empty, which means there
/// is nothing to emit for this fragment.
pub fn transform_thinking(fragment: &str, mode: ThinkTagsMode) -> String {
    let text = SUMMARY_SPAN.replace_all(fragment, "");
    let text = text
        .replace("</thinking>", "")
        .replace("<Full>", "")
        .replace("</Full>", "");
    let text = text.trim();

    let text = match mode {
        ThinkTagsMode::Think => DETAILS_OPEN
            .replace_all(text, "<think>")
            .replace("</details>", "</think>"),
        ThinkTagsMode::Strip => DETAILS_OPEN.replace_all(text, "").replace("</details>", ""),
        ThinkTagsMode::Raw => text.to_string(),
    };

    let text = text.strip_prefix("> ").unwrap_or(&text);
    let text = text.replace("\n> ", "\n");

    text.trim().to_string()
}
