//! Input document discovery.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::ConfigError;
use crate::pipeline::types::Document;

/// Lists input files under `dir` whose extension is in `extensions`.
///
/// The walk is recursive and sorted by file name at every level, so the
/// returned order is total and stable across runs. Unreadable entries are
/// skipped with a warning.
pub fn discover_documents(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingInputDir(dir.display().to_string()));
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable input entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| wanted.iter().any(|w| w.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if matches {
            paths.push(entry.into_path());
        }
    }

    Ok(paths)
}

/// Reads a discovered file into a pending [`Document`].
///
/// Invalid UTF-8 is decoded lossily; the text filter decides whether what
/// remains is usable.
pub async fn read_document(path: &Path, index: usize) -> std::io::Result<Document> {
    let bytes = tokio::fs::read(path).await?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(document = %path.display(), "Input is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    Ok(Document::new(path, index, text))
}
