//! `FSEntry` to kernel attribute conversion.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use vaulthalla_core::model::FSEntry;

const BLOCK_SIZE: u32 = 4096;

fn ts(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

/// Kernel attributes for an entry, with `ino` already mapped to the
/// mount-local inode space.
pub fn attr_for(entry: &FSEntry, ino: u64) -> FileAttr {
    let kind = if entry.is_dir() {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: entry.size_bytes,
        blocks: entry.size_bytes.div_ceil(512),
        atime: ts(entry.updated_at),
        mtime: ts(entry.updated_at),
        ctime: ts(entry.updated_at),
        crtime: ts(entry.created_at),
        kind,
        perm: (entry.mode & 0o7777) as u16,
        nlink: if entry.is_dir() { 2 } else { 1 },
        uid: entry.owner_uid,
        gid: entry.group_gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaulthalla_core::model::EntryKind;

    fn entry(kind: EntryKind) -> FSEntry {
        FSEntry {
            id: 5,
            inode: 42,
            parent_id: Some(1),
            vault_id: 1,
            name: "f".into(),
            base32_alias: "alias".into(),
            path: "/f".into(),
            kind,
            mode: 0o100644,
            owner_uid: 1000,
            group_gid: 1000,
            is_hidden: false,
            is_system: false,
            size_bytes: 1025,
            mime_type: None,
            content_hash: None,
            encryption_iv: None,
            key_version: 1,
            created_at: 1700000000,
            updated_at: 1700000100,
        }
    }

    #[test]
    fn test_file_attr() {
        let a = attr_for(&entry(EntryKind::File), 42);
        assert_eq!(a.ino, 42);
        assert_eq!(a.size, 1025);
        assert_eq!(a.blocks, 3);
        assert_eq!(a.kind, FileType::RegularFile);
        assert_eq!(a.perm, 0o644);
        assert_eq!(a.nlink, 1);
        assert_eq!(a.uid, 1000);
    }

    #[test]
    fn test_dir_attr() {
        let a = attr_for(&entry(EntryKind::Directory), 1);
        assert_eq!(a.kind, FileType::Directory);
        assert_eq!(a.nlink, 2);
    }

    #[test]
    fn test_negative_timestamp_clamped() {
        let mut e = entry(EntryKind::File);
        e.created_at = -5;
        let a = attr_for(&e, 42);
        assert_eq!(a.crtime, UNIX_EPOCH);
    }
}
