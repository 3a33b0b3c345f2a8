//! Fenced command block helpers.

use regex::Regex;

/// Fence that opens and closes every command block.
pub const FENCE: &str = "```";

fn block_pattern(tag: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?s){FENCE}{}(.*?){FENCE}", regex::escape(tag))).ok()
}

/// Return the bodies of all blocks opened by "```TAG" and closed by the next fence.
///
/// Bodies are joined with `\n`. Returns `None` when no complete block exists.
pub fn extract_block(raw: &str, tag: &str) -> Option<String> {
    let re = block_pattern(tag)?;
    let bodies: Vec<&str> = re
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if bodies.is_empty() {
        return None;
    }
    Some(bodies.join("\n"))
}

/// Return the body of the first complete "```TAG" block only.
pub fn first_block(raw: &str, tag: &str) -> Option<String> {
    let re = block_pattern(tag)?;
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Rewrite a plain "```python" fence into a REPLACE block.
///
/// Models frequently answer with a bare code fence instead of the command tag.
pub fn normalize_response(raw: &str) -> String {
    raw.replace("```python\n", "```REPLACE\n")
}

/// Render lines with their 0-based index, the way commands address them.
pub fn render_numbered(lines: &[String]) -> String {
    let mut buf = String::new();
    for (idx, line) in lines.iter().enumerate() {
        buf.push_str(&format!("{idx} |{line}\n"));
    }
    buf
}

/// Join a preamble and candidate lines into the program handed to the sandbox.
pub fn assemble_program(preamble: &str, lines: &[String]) -> String {
    if lines.is_empty() {
        return preamble.to_string();
    }
    format!("{}\n{}", preamble, lines.join("\n"))
}
