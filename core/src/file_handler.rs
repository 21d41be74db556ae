//! Per-session sandboxed list/read/write with traversal protection:
//! `canonicalize` + `starts_with` against the session's sandbox root,
//! checked before any filesystem call touches client-supplied paths.

use std::path::{Component, Path, PathBuf};

use crate::error::{CcrError, Result};
use crate::protocol::{FileEntry, FileEntryType};

/// `readFile` rejects anything larger than this.
pub const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

/// Extension → language tag, looked up for `FILE_CONTENT`'s `language`
/// field. Default `plaintext` for anything unrecognized.
fn language_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "md" | "markdown" => "markdown",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "html" | "htm" => "html",
        "css" => "css",
        "sh" | "bash" => "shell",
        "c" => "c",
        "h" | "hpp" => "cpp",
        "cpp" | "cc" | "cxx" => "cpp",
        "java" => "java",
        "rb" => "ruby",
        "php" => "php",
        "sql" => "sql",
        _ => "plaintext",
    }
}

/// Rejects absolute paths and any `..` component outright, before any
/// filesystem call is made.
fn reject_obvious_traversal(rel: &str) -> Result<&Path> {
    let path = Path::new(rel);
    if path.is_absolute() {
        return Err(CcrError::FileError("path traversal denied: absolute path".to_string()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CcrError::FileError("path traversal denied: '..' component".to_string()));
    }
    Ok(path)
}

/// Resolves `rel` against `sandbox_root`, requiring the joined path to
/// exist, and confirms its canonical form lies under the sandbox's
/// canonical root (defends against symlinks escaping the sandbox).
fn resolve_existing(sandbox_root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = reject_obvious_traversal(rel)?;
    let root = sandbox_root
        .canonicalize()
        .map_err(|e| CcrError::FileError(format!("sandbox root unavailable: {e}")))?;
    let candidate = root.join(rel_path);
    let resolved = candidate
        .canonicalize()
        .map_err(|e| CcrError::FileError(format!("not found: {e}")))?;
    if !resolved.starts_with(&root) {
        return Err(CcrError::FileError("path traversal denied".to_string()));
    }
    Ok(resolved)
}

/// Resolves `rel` for a write: parent directories are created first,
/// then the *parent's* canonical form is checked against the sandbox
/// root before the file itself (which may not yet exist) is written.
fn resolve_for_write(sandbox_root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = reject_obvious_traversal(rel)?;
    std::fs::create_dir_all(sandbox_root)
        .map_err(|e| CcrError::FileError(format!("sandbox root unavailable: {e}")))?;
    let root = sandbox_root
        .canonicalize()
        .map_err(|e| CcrError::FileError(format!("sandbox root unavailable: {e}")))?;
    let candidate = root.join(rel_path);
    if let Some(parent) = candidate.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CcrError::FileError(format!("failed to create directories: {e}")))?;
    }
    let parent_resolved = candidate
        .parent()
        .ok_or_else(|| CcrError::FileError("invalid path".to_string()))?
        .canonicalize()
        .map_err(|e| CcrError::FileError(format!("failed to resolve path: {e}")))?;
    if !parent_resolved.starts_with(&root) {
        return Err(CcrError::FileError("path traversal denied".to_string()));
    }
    Ok(parent_resolved.join(candidate.file_name().unwrap_or_default()))
}

/// Directories first, then alphabetical within each kind, skipping
/// dotfiles.
pub async fn list_files(sandbox_root: &Path, rel: &str) -> Result<Vec<FileEntry>> {
    let target = if rel.is_empty() {
        sandbox_root
            .canonicalize()
            .map_err(|e| CcrError::FileError(format!("sandbox root unavailable: {e}")))?
    } else {
        resolve_existing(sandbox_root, rel)?
    };
    let mut read_dir = tokio::fs::read_dir(&target)
        .await
        .map_err(|e| CcrError::FileError(e.to_string()))?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| CcrError::FileError(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| CcrError::FileError(e.to_string()))?;
        let kind = if metadata.is_dir() {
            FileEntryType::Directory
        } else {
            FileEntryType::File
        };
        entries.push(FileEntry {
            name,
            kind,
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| match (a.kind, b.kind) {
        (FileEntryType::Directory, FileEntryType::File) => std::cmp::Ordering::Less,
        (FileEntryType::File, FileEntryType::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
    Ok(entries)
}

/// Rejects with "File too large" if size exceeds `MAX_READ_BYTES`.
pub async fn read_file(sandbox_root: &Path, rel: &str) -> Result<(String, String)> {
    let resolved = resolve_existing(sandbox_root, rel)?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| CcrError::FileError(e.to_string()))?;
    if metadata.len() > MAX_READ_BYTES {
        return Err(CcrError::FileError("File too large".to_string()));
    }
    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|e| CcrError::FileError(e.to_string()))?;
    let content = String::from_utf8(bytes).map_err(|e| CcrError::FileError(e.to_string()))?;
    let language = resolved
        .extension()
        .and_then(|e| e.to_str())
        .map(language_for_extension)
        .unwrap_or("plaintext")
        .to_string();
    Ok((content, language))
}

/// Creates parent directories as needed, then writes UTF-8 content,
/// overwriting any existing file.
pub async fn write_file(sandbox_root: &Path, rel: &str, content: &str) -> Result<()> {
    let resolved = resolve_for_write(sandbox_root, rel)?;
    tokio::fs::write(&resolved, content.as_bytes())
        .await
        .map_err(|e| CcrError::FileError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = sandbox().await;
        write_file(dir.path(), "notes/todo.md", "# todo\n").await.unwrap();
        let (content, language) = read_file(dir.path(), "notes/todo.md").await.unwrap();
        assert_eq!(content, "# todo\n");
        assert_eq!(language, "markdown");
    }

    #[tokio::test]
    async fn list_files_sorts_dirs_first_then_alpha() {
        let dir = sandbox().await;
        write_file(dir.path(), "b.txt", "b").await.unwrap();
        write_file(dir.path(), "a.txt", "a").await.unwrap();
        write_file(dir.path(), "sub/inner.txt", "x").await.unwrap();
        write_file(dir.path(), ".hidden", "h").await.unwrap();
        let entries = list_files(dir.path(), "").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn rejects_parent_dir_traversal() {
        let dir = sandbox().await;
        assert!(read_file(dir.path(), "../../etc/passwd").await.is_err());
        assert!(write_file(dir.path(), "../escape.txt", "x").await.is_err());
        assert!(list_files(dir.path(), "..").await.is_err());
    }

    #[tokio::test]
    async fn rejects_absolute_path() {
        let dir = sandbox().await;
        assert!(read_file(dir.path(), "/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn oversized_read_is_rejected() {
        let dir = sandbox().await;
        let big = "x".repeat((MAX_READ_BYTES as usize) + 1);
        write_file(dir.path(), "big.txt", &big).await.unwrap();
        let err = read_file(dir.path(), "big.txt").await.unwrap_err();
        assert!(matches!(err, CcrError::FileError(ref m) if m == "File too large"));
    }
}
