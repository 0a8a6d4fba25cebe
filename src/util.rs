//! Shared utility functions for the Cadence crate.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the last complete top-level JSON object,
/// so trailing log noise before the final result line is tolerated.
pub fn extract_json_object(text: &str) -> Option<String> {
    let mut found = None;
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                {
                    found = Some(text[s..=i].to_string());
                }
            }
            _ => {}
        }
    }

    found
}

/// Write `contents` to `path` atomically.
///
/// The data goes to a sibling temp file which is flushed and then renamed over
/// the target, so readers observe either the old file or the new one.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
