//! The FUSE adapter: one mounted filesystem per vault.
//!
//! Every kernel call resolves its inode to an `FSEntry`, authorizes the
//! caller through the permission resolver, and runs the actual work on
//! the `fuse` pool; replies move into the dispatched task. Open files
//! buffer plaintext per handle and persist on flush/release, so a stream
//! of small writes costs one seal instead of hundreds.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::debug;

use vaulthalla_core::error::{Result, VaultError};
use vaulthalla_core::model::entry::join_rel;
use vaulthalla_core::model::{FSEntry, VaultPermission};
use vaulthalla_core::pool::{PoolManager, ThreadPool};
use vaulthalla_core::rbac::{Action, AuthManager};
use vaulthalla_core::storage::{Engine, StorageManager};

use crate::attr::attr_for;
use crate::error::errno_for;

/// Kernel attribute TTL; mutations invalidate eagerly.
const ATTR_TTL: Duration = Duration::from_secs(1);

struct OpenHandle {
    rel_path: String,
    buffer: Vec<u8>,
    dirty: bool,
}

/// Shared state cloned into every dispatched task.
struct FsShared {
    engine: Arc<Engine>,
    auth: Arc<AuthManager>,
    storage: Arc<StorageManager>,
    pools: Arc<PoolManager>,
    handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
    attr_cache: moka::sync::Cache<u64, FSEntry>,
}

/// `fuser::Filesystem` implementation for one vault mount.
pub struct VaultFilesystem {
    shared: Arc<FsShared>,
    pool: Arc<ThreadPool>,
}

impl VaultFilesystem {
    pub fn new(
        engine: Arc<Engine>,
        auth: Arc<AuthManager>,
        storage: Arc<StorageManager>,
        pools: Arc<PoolManager>,
    ) -> Self {
        let pool = pools.fuse_pool();
        Self {
            shared: Arc::new(FsShared {
                engine,
                auth,
                storage,
                pools,
                handles: DashMap::new(),
                next_fh: AtomicU64::new(1),
                attr_cache: moka::sync::Cache::builder()
                    .max_capacity(16_384)
                    .time_to_live(ATTR_TTL)
                    .build(),
            }),
            pool,
        }
    }

    fn dispatch(&self, task: impl FnOnce(&FsShared) + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        self.pool.submit(move || task(&shared));
    }
}

impl FsShared {
    /// Resolve a kernel inode: 1 is the vault root, everything else is
    /// the daemon-wide inode, rejected if it belongs to another vault.
    fn resolve_ino(&self, ino: u64) -> Result<FSEntry> {
        if ino == fuser::FUSE_ROOT_ID {
            return self.engine.root();
        }
        if let Some(hit) = self.attr_cache.get(&ino) {
            return Ok(hit);
        }
        let entry = self
            .engine
            .entry_by_inode(ino)?
            .filter(|e| e.vault_id == self.engine.vault_id())
            .ok_or_else(|| VaultError::NotFound(format!("inode {ino}")))?;
        self.attr_cache.insert(ino, entry.clone());
        Ok(entry)
    }

    /// Mount-local inode for an entry (the vault root is always 1).
    fn ino_out(&self, entry: &FSEntry) -> u64 {
        if entry.path == "/" {
            fuser::FUSE_ROOT_ID
        } else {
            entry.inode
        }
    }

    fn invalidate(&self, entry: &FSEntry) {
        self.attr_cache.invalidate(&entry.inode);
        self.attr_cache.invalidate(&self.ino_out(entry));
    }

    /// Authorize `perm` for the calling uid on `path`. uid 0 bypasses
    /// the resolver; unknown uids are denied.
    fn authorize(&self, uid: u32, perm: VaultPermission, path: &str) -> Result<()> {
        if uid == 0 {
            return Ok(());
        }
        let user = self
            .auth
            .user_by_uid(uid)?
            .ok_or_else(|| VaultError::PermissionDenied(format!("unknown uid {uid}")))?;
        self.auth
            .authorize(&user, Action::Vault(perm), self.engine.vault_id(), path)
    }

    /// Daemon user id behind a uid, for trash attribution.
    fn user_id(&self, uid: u32) -> i64 {
        if uid == 0 {
            return 0;
        }
        self.auth
            .user_by_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.id)
            .unwrap_or(0)
    }

    /// Persist a dirty handle and kick thumbnails for image content.
    fn persist_handle(&self, handle: &mut OpenHandle) -> Result<()> {
        if !handle.dirty {
            return Ok(());
        }
        self.engine.write_full(&handle.rel_path, &handle.buffer)?;
        handle.dirty = false;

        let entry = self.engine.entry(&handle.rel_path)?;
        self.invalidate(&entry);
        if entry
            .mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("image/"))
        {
            self.storage.spawn_thumbnails(
                &self.pools.thumb_pool(),
                handle.buffer.clone(),
                entry,
            );
        }
        Ok(())
    }
}

/// The permissions an `access(2)` mask requires on an entry.
fn perms_for_access(mask: i32, is_dir: bool) -> Vec<VaultPermission> {
    let mut out = Vec::new();
    if mask & libc::R_OK != 0 {
        out.push(if is_dir {
            VaultPermission::List
        } else {
            VaultPermission::Download
        });
    }
    if mask & libc::W_OK != 0 {
        out.push(VaultPermission::Create);
    }
    if mask & libc::X_OK != 0 && is_dir {
        out.push(VaultPermission::List);
    }
    out
}

macro_rules! reply_err {
    ($reply:expr, $err:expr) => {{
        let e = $err;
        debug!(error = %e, "fuse op failed");
        $reply.error(errno_for(&e));
    }};
}

impl Filesystem for VaultFilesystem {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let uid = req.uid();
        let name = name.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<(FSEntry, u64)> {
                let parent = fs.resolve_ino(parent)?;
                fs.authorize(uid, VaultPermission::List, &parent.path)?;
                let entry = fs.engine.child(&parent, &name)?;
                let ino = fs.ino_out(&entry);
                Ok((entry, ino))
            })();
            match result {
                Ok((entry, ino)) => reply.entry(&ATTR_TTL, &attr_for(&entry, ino), 0),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch(move |fs| match fs.resolve_ino(ino) {
            Ok(entry) => {
                let ino = fs.ino_out(&entry);
                reply.attr(&ATTR_TTL, &attr_for(&entry, ino));
            }
            Err(e) => reply_err!(reply, e),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let caller_uid = req.uid();
        self.dispatch(move |fs| {
            let result = (|| -> Result<FSEntry> {
                let entry = fs.resolve_ino(ino)?;
                fs.authorize(caller_uid, VaultPermission::Create, &entry.path)?;
                if let Some(new_size) = size {
                    fs.engine.truncate(&entry.path, new_size)?;
                }
                let updated = if mode.is_some() || uid.is_some() || gid.is_some() {
                    fs.engine.setattr(&entry.path, mode, uid, gid)?
                } else {
                    fs.engine.entry(&entry.path)?
                };
                fs.invalidate(&updated);
                Ok(updated)
            })();
            match result {
                Ok(entry) => {
                    let ino = fs.ino_out(&entry);
                    reply.attr(&ATTR_TTL, &attr_for(&entry, ino));
                }
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let uid = req.uid();
        self.dispatch(move |fs| {
            let result = (|| -> Result<Vec<(u64, fuser::FileType, String)>> {
                let dir = fs.resolve_ino(ino)?;
                fs.authorize(uid, VaultPermission::List, &dir.path)?;
                let mut rows = vec![
                    (fs.ino_out(&dir), fuser::FileType::Directory, ".".to_string()),
                    (fuser::FUSE_ROOT_ID, fuser::FileType::Directory, "..".to_string()),
                ];
                for child in fs.engine.listdir(&dir.path)? {
                    let kind = if child.is_dir() {
                        fuser::FileType::Directory
                    } else {
                        fuser::FileType::RegularFile
                    };
                    rows.push((child.inode, kind, child.name));
                }
                Ok(rows)
            })();
            match result {
                Ok(rows) => {
                    for (i, (ino, kind, name)) in
                        rows.into_iter().enumerate().skip(offset.max(0) as usize)
                    {
                        if reply.add(ino, (i + 1) as i64, kind, &name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let uid = req.uid();
        self.dispatch(move |fs| {
            let result = (|| -> Result<u64> {
                let entry = fs.resolve_ino(ino)?;
                if entry.is_dir() {
                    return Err(VaultError::InvalidArgument(format!(
                        "{} is a directory",
                        entry.path
                    )));
                }
                let writing = flags & libc::O_ACCMODE != libc::O_RDONLY;
                fs.authorize(
                    uid,
                    if writing {
                        VaultPermission::Create
                    } else {
                        VaultPermission::Download
                    },
                    &entry.path,
                )?;

                let buffer = if flags & libc::O_TRUNC != 0 {
                    Vec::new()
                } else {
                    fs.engine.read(&entry.path, 0, u32::MAX)?
                };
                let fh = fs.next_fh.fetch_add(1, Ordering::Relaxed);
                fs.handles.insert(
                    fh,
                    OpenHandle {
                        rel_path: entry.path.clone(),
                        buffer,
                        dirty: flags & libc::O_TRUNC != 0,
                    },
                );
                Ok(fh)
            })();
            match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.dispatch(move |fs| {
            let Some(handle) = fs.handles.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            let start = (offset.max(0) as usize).min(handle.buffer.len());
            let end = (start + size as usize).min(handle.buffer.len());
            reply.data(&handle.buffer[start..end]);
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.dispatch(move |fs| {
            let Some(mut handle) = fs.handles.get_mut(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            let start = offset.max(0) as usize;
            let end = start + data.len();
            if handle.buffer.len() < end {
                handle.buffer.resize(end, 0);
            }
            handle.buffer[start..end].copy_from_slice(&data);
            handle.dirty = true;
            reply.written(data.len() as u32);
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(move |fs| {
            let Some(mut handle) = fs.handles.get_mut(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match fs.persist_handle(&mut handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |fs| {
            let Some((_, mut handle)) = fs.handles.remove(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match fs.persist_handle(&mut handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let uid = req.uid();
        let gid = req.gid();
        let name = name.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<(FSEntry, u64, u64)> {
                let parent = fs.resolve_ino(parent)?;
                let path = join_rel(&parent.path, &name);
                fs.authorize(uid, VaultPermission::Create, &path)?;
                let entry = fs.engine.create(&parent.path, &name, mode, uid, gid)?;
                fs.invalidate(&parent);

                let fh = fs.next_fh.fetch_add(1, Ordering::Relaxed);
                fs.handles.insert(
                    fh,
                    OpenHandle {
                        rel_path: entry.path.clone(),
                        buffer: Vec::new(),
                        dirty: false,
                    },
                );
                let ino = fs.ino_out(&entry);
                Ok((entry, ino, fh))
            })();
            match result {
                Ok((entry, ino, fh)) => {
                    reply.created(&ATTR_TTL, &attr_for(&entry, ino), 0, fh, 0);
                }
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let uid = req.uid();
        let gid = req.gid();
        let name = name.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<(FSEntry, u64)> {
                let parent = fs.resolve_ino(parent)?;
                let path = join_rel(&parent.path, &name);
                fs.authorize(uid, VaultPermission::Create, &path)?;
                let entry = fs.engine.mkdir(&parent.path, &name, mode, uid, gid)?;
                fs.invalidate(&parent);
                let ino = fs.ino_out(&entry);
                Ok((entry, ino))
            })();
            match result {
                Ok((entry, ino)) => reply.entry(&ATTR_TTL, &attr_for(&entry, ino), 0),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let uid = req.uid();
        let name = name.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<()> {
                let parent = fs.resolve_ino(parent)?;
                let entry = fs.engine.child(&parent, &name)?;
                fs.authorize(uid, VaultPermission::Delete, &entry.path)?;
                fs.engine.unlink(&entry.path, fs.user_id(uid))?;
                fs.invalidate(&entry);
                fs.invalidate(&parent);
                Ok(())
            })();
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let uid = req.uid();
        let name = name.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<()> {
                let parent = fs.resolve_ino(parent)?;
                let entry = fs.engine.child(&parent, &name)?;
                fs.authorize(uid, VaultPermission::Delete, &entry.path)?;
                fs.engine.rmdir(&entry.path)?;
                fs.invalidate(&entry);
                fs.invalidate(&parent);
                Ok(())
            })();
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let uid = req.uid();
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        self.dispatch(move |fs| {
            let result = (|| -> Result<()> {
                let old_parent = fs.resolve_ino(parent)?;
                let new_parent = fs.resolve_ino(newparent)?;
                let old_path = join_rel(&old_parent.path, &name);
                let new_path = join_rel(&new_parent.path, &newname);

                let perm = if parent == newparent {
                    VaultPermission::Rename
                } else {
                    VaultPermission::Move
                };
                fs.authorize(uid, perm, &old_path)?;

                let entry = fs.engine.rename(&old_path, &new_path)?;
                fs.invalidate(&entry);
                fs.invalidate(&old_parent);
                fs.invalidate(&new_parent);
                Ok(())
            })();
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let uid = req.uid();
        self.dispatch(move |fs| {
            let result = (|| -> Result<()> {
                let entry = fs.resolve_ino(ino)?;
                for perm in perms_for_access(mask, entry.is_dir()) {
                    fs.authorize(uid, perm, &entry.path)?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply_err!(reply, e),
            }
        });
    }
}
