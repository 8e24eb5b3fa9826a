//! Per-client sessions and the process-wide session table.
//!
//! A session is created by a successful MOUNT and owns two bounded handle
//! tables plus a single-slot replay cache. The table hands out non-zero ids
//! from a rotating space so a stale client is unlikely to collide with a
//! newer session reusing its id.

use crate::error::{Result, Status};
use crate::proto::{DirEntry, MAX_DIR_HANDLES, MAX_FILE_HANDLES, MAX_SESSIONS};
use bytes::Bytes;
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;

/// Sessions idle longer than this are reaped
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Reaper cadence
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An open file owned by a session. The stored offset is authoritative:
/// every read and write positions the descriptor from it first.
#[derive(Debug)]
pub struct FileHandle {
    pub file: fs::File,
    pub path: PathBuf,
    pub flags: u16,
    pub offset: u64,
}

/// An open directory enumeration. The entry list is materialized when the
/// handle is opened and never changes afterwards, so reads stay stable no
/// matter what happens on disk underneath.
#[derive(Debug)]
pub struct DirHandle {
    pub path: PathBuf,
    pub entries: Vec<DirEntry>,
    pub position: usize,
}

/// Server-side state for one mounted client.
#[derive(Debug)]
pub struct Session {
    pub sid: u16,
    pub addr: SocketAddr,
    /// Client protocol version from MOUNT; advisory only
    pub version: u16,
    pub mount_path: String,
    last_activity: Instant,
    files: [Option<FileHandle>; MAX_FILE_HANDLES],
    dirs: [Option<DirHandle>; MAX_DIR_HANDLES],
    last_seq: u8,
    last_reply: Option<Bytes>,
    unmounted: bool,
}

impl Session {
    fn new(sid: u16, addr: SocketAddr, version: u16, mount_path: String) -> Session {
        Session {
            sid,
            addr,
            version,
            mount_path,
            last_activity: Instant::now(),
            files: std::array::from_fn(|_| None),
            dirs: std::array::from_fn(|_| None),
            last_seq: 0,
            last_reply: None,
            unmounted: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// Cached reply for a retransmitted request, if the sequence matches.
    pub fn replay(&self, seq: u8) -> Option<Bytes> {
        match &self.last_reply {
            Some(reply) if seq == self.last_seq => Some(reply.clone()),
            _ => None,
        }
    }

    /// Record the reply to a freshly executed request.
    pub fn cache_reply(&mut self, seq: u8, reply: Bytes) {
        self.last_seq = seq;
        self.last_reply = Some(reply);
    }

    /// An unmounted session holds no handles; it lingers only so a
    /// retransmitted UMOUNT can be answered from the replay cache.
    pub fn mark_unmounted(&mut self) {
        self.unmounted = true;
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted
    }

    pub fn free_file_slot(&self) -> Option<usize> {
        self.files.iter().position(Option::is_none)
    }

    pub fn free_dir_slot(&self) -> Option<usize> {
        self.dirs.iter().position(Option::is_none)
    }

    pub fn put_file(&mut self, slot: usize, handle: FileHandle) {
        self.files[slot] = Some(handle);
    }

    pub fn put_dir(&mut self, slot: usize, handle: DirHandle) {
        self.dirs[slot] = Some(handle);
    }

    pub fn file_mut(&mut self, handle: u8) -> Result<&mut FileHandle> {
        self.files
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Status::Ebadf.into())
    }

    pub fn dir_mut(&mut self, handle: u8) -> Result<&mut DirHandle> {
        self.dirs
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Status::Ebadf.into())
    }

    pub fn take_file(&mut self, handle: u8) -> Result<FileHandle> {
        self.files
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or_else(|| Status::Ebadf.into())
    }

    pub fn take_dir(&mut self, handle: u8) -> Result<DirHandle> {
        self.dirs
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or_else(|| Status::Ebadf.into())
    }

    /// Release every remaining handle. Descriptors are closed here, before
    /// the session record itself is dropped.
    pub async fn release_all(&mut self) {
        for slot in self.files.iter_mut() {
            if let Some(handle) = slot.take() {
                debug!("session {}: closing leftover file {:?}", self.sid, handle.path);
                drop(handle.file.into_std().await);
            }
        }
        for slot in self.dirs.iter_mut() {
            if let Some(handle) = slot.take() {
                debug!("session {}: dropping leftover dir {:?}", self.sid, handle.path);
            }
        }
    }
}

/// Process-wide session registry, owned by the event loop.
pub struct SessionTable {
    sessions: HashMap<u16, Session>,
    next_sid: u16,
    timeout: Duration,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::with_timeout(SESSION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> SessionTable {
        SessionTable {
            sessions: HashMap::new(),
            next_sid: 1,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocate a session with a fresh non-zero id. Ids rotate through the
    /// 16-bit space instead of reusing the lowest free value, so an id is
    /// not reissued right after its session dies.
    pub fn allocate(
        &mut self,
        addr: SocketAddr,
        version: u16,
        mount_path: String,
    ) -> Result<&mut Session> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(Status::Eusers.into());
        }

        let mut sid = self.next_sid;
        while sid == 0 || self.sessions.contains_key(&sid) {
            sid = sid.wrapping_add(1);
        }
        self.next_sid = sid.wrapping_add(1);

        info!("session {}: mounted {:?} from {}", sid, mount_path, addr);
        let session = Session::new(sid, addr, version, mount_path);
        Ok(self.sessions.entry(sid).or_insert(session))
    }

    pub fn get_mut(&mut self, sid: u16) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u16> {
        self.sessions
            .values()
            .find(|s| s.addr == addr)
            .map(|s| s.sid)
    }

    /// Close all handles owned by the session, then drop the record.
    pub async fn destroy(&mut self, sid: u16) {
        if let Some(mut session) = self.sessions.remove(&sid) {
            session.release_all().await;
            info!("session {}: destroyed", sid);
        }
    }

    /// Destroy every session idle past the timeout.
    pub async fn sweep(&mut self) {
        let expired: Vec<u16> = self
            .sessions
            .values()
            .filter(|s| s.expired(self.timeout))
            .map(|s| s.sid)
            .collect();

        for sid in expired {
            debug!("session {}: idle timeout", sid);
            self.destroy(sid).await;
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}
