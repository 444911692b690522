//! Filesystem entries: the unified file/directory row, per-directory
//! aggregate stats, and soft-deleted files.
//!
//! Paths in the model are always canonical vault-relative paths with a
//! leading `/`. FUSE-visible and backing paths are derived on demand from
//! the mount root and the ancestor alias chain; they are never stored.

use std::path::{Path, PathBuf};

/// Whether an entry row is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// A single `fs_entry` row.
///
/// Files carry content metadata (`mime_type`, `content_hash`,
/// `encryption_iv`, `key_version`); directories carry their aggregates in
/// [`DirStats`] instead.
#[derive(Debug, Clone)]
pub struct FSEntry {
    pub id: i64,
    /// FUSE-visible inode, unique across the whole daemon.
    pub inode: u64,
    /// `None` only for the global root.
    pub parent_id: Option<i64>,
    pub vault_id: i64,
    /// User-facing file name.
    pub name: String,
    /// Opaque on-disk name, unique within a vault, stable across renames.
    pub base32_alias: String,
    /// Canonical vault-relative path with leading `/`.
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub is_hidden: bool,
    pub is_system: bool,
    /// File size, or the directory's aggregated descendant bytes.
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    /// Hex SHA-256 of the plaintext content.
    pub content_hash: Option<String>,
    /// Base64 of the 12-byte AEAD nonce.
    pub encryption_iv: Option<String>,
    /// Vault key version the blob was encrypted with.
    pub key_version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FSEntry {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Parent portion of the canonical path (`/a/b.txt` -> `/a`).
    pub fn parent_path(&self) -> String {
        parent_of(&self.path)
    }
}

/// Canonicalize a vault-relative path: leading `/`, no trailing slash,
/// no empty or dot segments.
pub fn canonical_rel_path(raw: &str) -> String {
    let mut out = String::from("/");
    for seg in raw.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(seg);
    }
    out
}

/// Parent of a canonical path; the root's parent is the root itself.
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Join a canonical directory path and a child name.
pub fn join_rel(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// The longest common ancestor of two canonical paths.
pub fn common_prefix(a: &str, b: &str) -> String {
    let mut prefix = String::from("/");
    let mut cur = String::new();
    for (sa, sb) in a.split('/').zip(b.split('/')) {
        if sa != sb || sa.is_empty() {
            if sa.is_empty() && sb.is_empty() {
                continue;
            }
            break;
        }
        cur.push('/');
        cur.push_str(sa);
        prefix = cur.clone();
    }
    prefix
}

/// MIME type guessed from the file name extension.
///
/// The original store kept a `mime_type` column filled at create time;
/// unknown extensions fall back to `application/octet-stream`.
pub fn mime_for_name(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") | Some("md") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Per-directory aggregate counters, maintained transactionally alongside
/// every mutation that changes the tree shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirStats {
    pub dir_id: i64,
    pub size_bytes: i64,
    pub file_count: i64,
    pub subdirectory_count: i64,
}

/// A soft-deleted file, retained until purge.
#[derive(Debug, Clone)]
pub struct TrashedFile {
    pub id: i64,
    pub vault_id: i64,
    pub name: String,
    /// Canonical path the file had when trashed.
    pub path: String,
    /// Ciphertext blob location recorded at trash time.
    pub backing_path: PathBuf,
    pub size_bytes: u64,
    pub deleted_by: i64,
    pub trashed_at: i64,
    pub purged: bool,
}
