//! Shared utility functions for the issueflow crate.

use std::fs;
use std::io;
use std::path::Path;

/// Return the widest `{ ... }` span in `text`: from the first `{` to the last
/// `}`. Generated text often wraps a JSON object in prose, and the outermost
/// span is the one most likely to be the full object.
pub fn widest_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Truncate to at most `max_chars` characters, appending a marker when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

/// Write `contents` to `path` so readers never observe a partial file:
/// write a sibling temp file, then rename over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a file path: {}", path.display()),
        ));
    };
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}
