//! Select the local files that make up a site and describe how to serve them

use crate::aws::Error;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Cache lifetime for pages, stylesheets, and scripts
pub const CACHE_CONTROL: &str = "max-age=3600";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A local file and the object key it is uploaded to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub key: String,
}

/// Walks `source_dir` and returns every file to upload, sorted by key.
///
/// Directories named in `exclude_dirs` are pruned at any depth. Files whose
/// lower-cased name ends with one of `exclude_extensions` are skipped.
pub fn collect_uploads(
    source_dir: &Path,
    exclude_dirs: &[String],
    exclude_extensions: &[String],
) -> Result<Vec<LocalFile>, Error> {
    let extensions: Vec<String> = exclude_extensions
        .iter()
        .map(|ext| ext.to_lowercase())
        .collect();
    let mut files = Vec::new();
    let mut pending = vec![source_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                if !exclude_dirs.iter().any(|excluded| *excluded == name) {
                    pending.push(path);
                }
                continue;
            }
            let lower = name.to_lowercase();
            if extensions.iter().any(|ext| lower.ends_with(ext.as_str())) {
                continue;
            }
            let key = object_key(source_dir, &path);
            files.push(LocalFile { path, key });
        }
    }
    files.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(files)
}

/// Object key of `path`: its path relative to `root`, joined with `/`
fn object_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Guesses the content type of `path` from its extension
pub fn content_type(path: &Path) -> &'static str {
    let Some(extension) = path.extension() else {
        return DEFAULT_CONTENT_TYPE;
    };
    match extension.to_string_lossy().to_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Cache-Control header for objects of `content_type`, if any
pub fn cache_control(content_type: &str) -> Option<&'static str> {
    matches!(
        content_type,
        "text/html" | "text/css" | "application/javascript"
    )
    .then_some(CACHE_CONTROL)
}
