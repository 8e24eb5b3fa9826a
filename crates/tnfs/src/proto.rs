//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 1.2

use bitflags::bitflags;
use enum_primitive::*;

/// Default UDP port tnfsd listens on
pub const TNFSD_PORT: u16 = 16384;

/// Largest datagram either side may send
pub const MAX_MSGSZ: usize = 532;

/// Request header: sid[2] seq[1] cmd[1]
pub const HEADERSZ: usize = 4;

/// Room left for a reply payload after header and status byte
pub const MAX_PAYLOAD: usize = MAX_MSGSZ - HEADERSZ - 1;

/// Largest block a single read or write may transfer
pub const MAX_IOSZ: usize = 512;

/// File handle slots per session
pub const MAX_FILE_HANDLES: usize = 16;

/// Directory handle slots per session
pub const MAX_DIR_HANDLES: usize = 16;

/// Live session cap across all clients
pub const MAX_SESSIONS: usize = 4096;

/// Server protocol version, minor then major on the wire
pub const PROTO_VERSION_MINOR: u8 = 0x02;
pub const PROTO_VERSION_MAJOR: u8 = 0x01;

/// Minimum interval a client should wait before retransmitting, in ms
pub const MIN_RETRY_MS: u16 = 1000;

/// Bit set in the READDIRX reply status once the cursor has hit the end
pub const DIRSTATUS_EOF: u8 = 0x01;

enum_from_primitive! {
    /// Command opcodes. The high nibble is the command class:
    /// 0x0n session, 0x1n directory, 0x2n file.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Cmd {
        Mount       = 0x00,
        Umount      = 0x01,

        OpenDir     = 0x10,
        ReadDir     = 0x11,
        CloseDir    = 0x12,
        MkDir       = 0x13,
        RmDir       = 0x14,
        TellDir     = 0x15,
        SeekDir     = 0x16,
        OpenDirX    = 0x17,
        ReadDirX    = 0x18,

        OpenFileOld = 0x20,
        ReadBlock   = 0x21,
        WriteBlock  = 0x22,
        CloseFile   = 0x23,
        StatFile    = 0x24,
        SeekFile    = 0x25,
        UnlinkFile  = 0x26,
        ChmodFile   = 0x27,
        RenameFile  = 0x28,
        OpenFile    = 0x29,
    }
}

/// Open-file flag encoding as sent by clients.
///
/// The low two bits select the access mode and are not independent flags.
pub mod of {
    /// Access mode mask
    pub const ACCMODE: u16 = 0x0003;
    /// Open for read
    pub const RDONLY: u16 = 0x0001;
    /// Open for write
    pub const WRONLY: u16 = 0x0002;
    /// Open for read and write
    pub const RDWR: u16 = 0x0003;
    /// Writes always land at the end
    pub const APPEND: u16 = 0x0008;
    /// Create the file if absent
    pub const CREATE: u16 = 0x0100;
    /// Truncate to zero length on open
    pub const TRUNCATE: u16 = 0x0200;
    /// Fail if the file already exists
    pub const EXCLUSIVE: u16 = 0x0400;
}

/// Seek whence bytes
pub mod whence {
    pub const SET: u8 = 0x00;
    pub const CUR: u8 = 0x01;
    pub const END: u8 = 0x02;
}

bitflags! {
    /// Per-entry flag word in extended directory batches
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        const DIR     = 0x01;
        const HIDDEN  = 0x02;
        const SPECIAL = 0x04;
    }
}

bitflags! {
    /// OPENDIRX behavior bits
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DirOpts: u8 {
        #[doc = "Do not group directories ahead of files"]
        const NO_FOLDERS_FIRST = 0x01;
        #[doc = "Surface dot-prefixed entries"]
        const INCLUDE_HIDDEN   = 0x02;
        #[doc = "Surface the synthetic `.` and `..` entries"]
        const INCLUDE_SPECIAL  = 0x04;
        #[doc = "Apply the glob pattern to directories as well as files"]
        const PATTERN_DIRS     = 0x08;
    }
}

bitflags! {
    /// OPENDIRX sort bits; default is case-insensitive name, ascending
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SortOpts: u8 {
        #[doc = "Leave entries in host order"]
        const NONE           = 0x01;
        #[doc = "Sort names case-sensitively"]
        const CASE_SENSITIVE = 0x02;
        #[doc = "Reverse the sort direction"]
        const DESCENDING     = 0x04;
        #[doc = "Sort by modification time"]
        const BY_MTIME       = 0x08;
        #[doc = "Sort by size"]
        const BY_SIZE        = 0x10;
    }
}

/// Fixed-layout request/reply header. Replies append a status byte.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Session id, zero only on MOUNT
    pub sid: u16,
    /// Client-chosen sequence number, wraps modulo 256
    pub seq: u8,
    /// Raw command opcode
    pub cmd: u8,
}

/// One materialized directory entry, as carried by READDIRX and held in
/// every directory handle's frozen snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub flags: EntryFlags,
    pub size: u64,
    pub mtime: u32,
    pub name: String,
}

impl DirEntry {
    /// Encoded size on the wire: flags, size, mtime, name, terminator
    pub fn wire_len(&self) -> usize {
        1 + 8 + 4 + self.name.len() + 1
    }
}

/// STATFILE reply body
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// A decoded request body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Mount { version: u16, path: String, user: String, password: String },
    Umount,

    OpenDir { path: String },
    ReadDir { handle: u8 },
    CloseDir { handle: u8 },
    MkDir { path: String },
    RmDir { path: String },
    TellDir { handle: u8 },
    SeekDir { handle: u8, position: u32 },
    OpenDirX { opts: DirOpts, sort: SortOpts, max_results: u16, pattern: String, path: String },
    ReadDirX { handle: u8, count: u8 },

    OpenFileOld { flags: u16, path: String },
    OpenFile { flags: u16, mode: u16, path: String },
    ReadBlock { handle: u8, count: u16 },
    WriteBlock { handle: u8, data: Vec<u8> },
    CloseFile { handle: u8 },
    StatFile { path: String },
    SeekFile { handle: u8, whence: u8, offset: u32 },
    UnlinkFile { path: String },
    ChmodFile { mode: u16, path: String },
    RenameFile { from: String, to: String },
}

/// A reply body, encoded after the header and status byte
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Status byte only
    Empty,
    /// MOUNT: server version and retry-interval suggestion
    Mount { version_minor: u8, version_major: u8, retry_ms: u16 },
    /// Open file/dir: the allocated handle id
    Handle(u8),
    /// OPENDIRX: handle id plus total entries in the snapshot
    DirOpened { handle: u8, count: u16 },
    /// Legacy READDIR: next entry name
    DirEntryName(String),
    /// TELLDIR
    DirPos(u32),
    /// READDIRX batch; count on the wire is `entries.len()`
    DirBatch { status: u8, dpos: u16, entries: Vec<DirEntry> },
    /// READBLOCK: count-prefixed data
    Block(Vec<u8>),
    /// Read past the end: count 0, end-of-file status
    EndOfFile,
    /// WRITEBLOCK: bytes actually written
    Written(u16),
    /// SEEKFILE: resulting absolute position
    FilePos(u32),
    /// STATFILE
    Stat(FileStat),
}

/// Translate a legacy OPENFILE_OLD flag word into the current encoding.
///
/// The legacy high byte carried append in bit 0 and the remaining bits
/// one position left of where the current form keeps them.
pub fn translate_old_flags(flags: u16) -> u16 {
    let lo = flags & 0x00ff;
    let hi = (flags >> 8) & 0x00ff;
    let mut out = lo;
    if hi & 0x01 != 0 {
        out |= of::APPEND;
    }
    out | ((hi >> 1) << 8)
}
