//! Filesystem-safe names for library and device paths.

use regex::Regex;

/// Turn a display title into a file or directory name.
///
/// Characters other than word characters, whitespace and `-` are stripped,
/// whitespace runs become a single `_`, and the result is trimmed. If
/// nothing is left, `fallback` is returned.
#[must_use]
pub fn sanitize_name(title: &str, fallback: &str) -> String {
    clean_title(title)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn clean_title(title: &str) -> Option<String> {
    let disallowed = Regex::new(r"[^\w\s-]").ok()?;
    let whitespace = Regex::new(r"\s+").ok()?;
    let stripped = disallowed.replace_all(title, "");
    Some(whitespace.replace_all(stripped.trim(), "_").into_owned())
}

/// File name of a finished track in the library.
#[must_use]
pub fn track_file_name(title: &str, id: &str) -> String {
    format!("{}__normalized__{id}.mp3", sanitize_name(title, id))
}

/// Directory name of a finished episode in the library.
#[must_use]
pub fn episode_dir_name(title: &str, id: &str) -> String {
    sanitize_name(&format!("{title}_{id}"), id)
}

/// File name of one finished episode segment (1-based index).
#[must_use]
pub fn segment_file_name(title: &str, id: &str, index: usize) -> String {
    format!("{}_{id}_{index:03}.mp3", sanitize_name(title, "episode"))
}
