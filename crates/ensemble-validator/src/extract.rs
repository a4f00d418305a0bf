//! Fenced code block extraction

use regex::Regex;

/// Pull code out of an LLM response. Preference order: the largest fenced
/// block tagged with `preferred_language` (or its two-letter prefix), then
/// the largest fenced block of any language, then the trimmed text itself.
pub fn extract_code(text: &str, preferred_language: Option<&str>) -> String {
    let fence = match Regex::new(r"(?s)```([A-Za-z0-9+#_-]*)[ \t]*\n(.*?)```") {
        Ok(re) => re,
        Err(_) => return text.trim().to_string(),
    };

    let blocks: Vec<(String, String)> = fence
        .captures_iter(text)
        .map(|cap| (cap[1].to_lowercase(), cap[2].to_string()))
        .collect();

    if blocks.is_empty() {
        return text.trim().to_string();
    }

    if let Some(lang) = preferred_language {
        let lang = lang.to_lowercase();
        let prefix: String = lang.chars().take(2).collect();
        let best = blocks
            .iter()
            .filter(|(tag, _)| *tag == lang || (!tag.is_empty() && *tag == prefix))
            .max_by_key(|(_, code)| code.len());
        if let Some((_, code)) = best {
            return trim_block(code);
        }
    }

    match blocks.iter().max_by_key(|(_, code)| code.len()) {
        Some((_, code)) => trim_block(code),
        None => text.trim().to_string(),
    }
}

/// Inverse of extraction for any code that does not itself contain a fence.
pub fn wrap_in_fence(code: &str, language: &str) -> String {
    format!("```{}\n{}\n```", language, code)
}

fn trim_block(code: &str) -> String {
    code.strip_suffix('\n').unwrap_or(code).to_string()
}
