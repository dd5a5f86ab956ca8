//! Writing the finished document to disk.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_OUTPUT: &str = "rss.xml";

/// Relative paths are joined to `root`; absolute ones are kept.
pub fn resolve_output_path(root: &Path, output: Option<&Path>) -> PathBuf {
    let output = output.unwrap_or_else(|| Path::new(DEFAULT_OUTPUT));
    if output.is_absolute() {
        output.to_path_buf()
    } else {
        root.join(output)
    }
}

/// Creates parent directories, then writes through a sibling temp file and
/// renames it over `path`, so a failure leaves any existing file untouched.
pub async fn write_feed(path: &Path, xml: &str) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::filesystem(parent, e))?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| {
            Error::filesystem(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "output path has no file name"),
            )
        })?
        .to_string_lossy();
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));

    if let Err(e) = tokio::fs::write(&temp_path, xml.as_bytes()).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(Error::filesystem(&temp_path, e));
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(Error::filesystem(path, e));
    }

    tracing::debug!(path = %path.display(), bytes = xml.len(), "Feed written");
    Ok(xml.len())
}

/// `path` relative to `root` when it lies inside it, for the success line.
pub fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
