//! Checklist line parsing
//!
//! Recognises Markdown task-list lines (`- [ ] text`, `* [x] text`,
//! `+ [X] text`, optionally indented) and rewrites a single checkbox marker
//! in place without touching the rest of the body.

/// One checklist line found in a note body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistItem {
    /// Zero-based line number in the body
    pub line_index: usize,
    pub checked: bool,
    /// Item text with surrounding whitespace removed
    pub text: String,
    /// How many earlier items carry the same text; keeps duplicate lines
    /// apart when fingerprinting
    pub occurrence: usize,
}

impl ChecklistItem {
    /// Stable identity of the line, independent of its checkbox state and
    /// position in the body
    pub fn identity(&self) -> String {
        format!("{}\u{0}{}", self.text, self.occurrence)
    }
}

/// Byte offset of the checkbox state character, and whether it is checked
fn marker(line: &str) -> Option<(usize, bool)> {
    let indent = line.len() - line.trim_start().len();
    let rest = &line[indent..];

    if !matches!(rest.chars().next(), Some('-' | '*' | '+')) {
        return None;
    }
    if !rest[1..].starts_with(" [") {
        return None;
    }

    let state_at = indent + 3;
    let checked = match line.as_bytes().get(state_at) {
        Some(b' ') => false,
        Some(b'x' | b'X') => true,
        _ => return None,
    };
    if line.as_bytes().get(state_at + 1) != Some(&b']') {
        return None;
    }
    // Require whitespace or end of line after the box
    match line.as_bytes().get(state_at + 2) {
        None | Some(b' ' | b'\t' | b'\r') => Some((state_at, checked)),
        _ => None,
    }
}

/// Every non-empty checklist item in `body`, top to bottom
pub fn parse(body: &str) -> Vec<ChecklistItem> {
    let mut items: Vec<ChecklistItem> = Vec::new();

    for (line_index, line) in body.lines().enumerate() {
        let Some((state_at, checked)) = marker(line) else {
            continue;
        };
        let text = line[state_at + 2..].trim();
        if text.is_empty() {
            continue;
        }

        let occurrence = items.iter().filter(|i| i.text == text).count();
        items.push(ChecklistItem {
            line_index,
            checked,
            text: text.to_string(),
            occurrence,
        });
    }

    items
}

/// Set the checkbox on `line_index`. Returns `None` when that line is not a
/// checklist item; returns the body unchanged when it already matches.
pub fn set_checkbox(body: &str, line_index: usize, checked: bool) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut found = false;

    for (i, line) in body.split_inclusive('\n').enumerate() {
        if i != line_index {
            out.push_str(line);
            continue;
        }

        let (state_at, _) = marker(line)?;
        out.push_str(&line[..state_at]);
        out.push(if checked { 'x' } else { ' ' });
        out.push_str(&line[state_at + 1..]);
        found = true;
    }

    found.then_some(out)
}
