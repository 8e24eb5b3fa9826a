//! Host filesystem mediator.
//!
//! Every client-supplied path is confined to the export root: `.` and `..`
//! are collapsed textually before any host call, and whatever the host
//! resolves (symlinks included) must still land beneath the root. Host
//! errors never leave this module untranslated.

use {
    crate::{
        error::{Result, Status},
        proto::{
            of, whence, DirEntry, DirOpts, EntryFlags, FileStat, Reply, SortOpts, DIRSTATUS_EOF,
            MAX_IOSZ, MAX_PAYLOAD,
        },
        session::{DirHandle, FileHandle, Session},
    },
    log::debug,
    nix::{fcntl::OFlag, sys::stat::Mode},
    std::{
        io::{self, SeekFrom},
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    },
    tokio_stream::{wrappers::ReadDirStream, StreamExt},
};

/// The directory tree served to clients.
pub struct Export {
    root: PathBuf,
}

impl Export {
    /// The root is canonicalized once so later prefix checks compare
    /// like with like.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Export> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "export root must be a directory",
            ));
        }
        Ok(Export { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Textual confinement: interpret the client path as rooted at the
    /// export root, collapse `.`/`..`, and reject anything that would
    /// climb out. No host call is made.
    pub fn resolve(&self, client_path: &str) -> Result<PathBuf> {
        if client_path.as_bytes().contains(&0) {
            return Err(Status::Einval.into());
        }

        let mut stack: Vec<&str> = Vec::new();
        for segment in client_path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if stack.pop().is_none() {
                        return Err(Status::Eacces.into());
                    }
                }
                name => stack.push(name),
            }
        }

        let mut full = self.root.clone();
        full.extend(&stack);
        Ok(full)
    }

    async fn canonical_inside(&self, full: &Path) -> Result<PathBuf> {
        let real = fs::canonicalize(full).await?;
        if !real.starts_with(&self.root) {
            return Err(Status::Eacces.into());
        }
        Ok(real)
    }

    /// Confine a path that must already exist, following host symlinks.
    pub async fn resolve_existing(&self, client_path: &str) -> Result<PathBuf> {
        let full = self.resolve(client_path)?;
        self.canonical_inside(&full).await
    }

    /// Confine a path operated on by name: the final component may be
    /// missing (create, mkdir) or must not be followed through a link
    /// (unlink, rename, rmdir). The parent is what gets host-resolved.
    pub async fn resolve_parented(&self, client_path: &str) -> Result<PathBuf> {
        let full = self.resolve(client_path)?;
        if full == self.root {
            return Ok(full);
        }
        let name = full.file_name().ok_or(Status::Einval)?.to_owned();
        let parent = full.parent().ok_or(Status::Eacces)?;
        let real_parent = self.canonical_inside(parent).await?;
        Ok(real_parent.join(name))
    }

    /*
     * File operations
     */

    pub async fn open_file(
        &self,
        session: &mut Session,
        flags: u16,
        mode: u16,
        path: &str,
    ) -> Result<Reply> {
        let slot = session.free_file_slot().ok_or(Status::Emfile)?;

        let real = match self.resolve_existing(path).await {
            Ok(real) => real,
            Err(e) if flags & of::CREATE != 0 && e.status() == Status::Enoent => {
                self.resolve_parented(path).await?
            }
            Err(e) => return Err(e),
        };

        let fd = nix::fcntl::open(
            &real,
            host_flags(flags),
            Mode::from_bits_truncate(mode as nix::libc::mode_t),
        )?;
        let file = fs::File::from_std(std::fs::File::from(fd));

        debug!("session {}: open {:?} flags {:#06x} -> handle {}", session.sid, real, flags, slot);
        session.put_file(
            slot,
            FileHandle {
                file,
                path: real,
                flags,
                offset: 0,
            },
        );
        Ok(Reply::Handle(slot as u8))
    }

    pub async fn read_block(&self, session: &mut Session, handle: u8, count: u16) -> Result<Reply> {
        let count = (count as usize).min(MAX_IOSZ);
        let fh = session.file_mut(handle)?;
        fh.file.seek(SeekFrom::Start(fh.offset)).await?;

        let mut buf = vec![0u8; count];
        let mut total = 0;
        while total < count {
            let n = fh.file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }

        if total == 0 && count > 0 {
            return Ok(Reply::EndOfFile);
        }

        buf.truncate(total);
        fh.offset += total as u64;
        Ok(Reply::Block(buf))
    }

    pub async fn write_block(
        &self,
        session: &mut Session,
        handle: u8,
        data: &[u8],
    ) -> Result<Reply> {
        let fh = session.file_mut(handle)?;
        fh.file.seek(SeekFrom::Start(fh.offset)).await?;
        fh.file.write_all(data).await?;
        fh.file.flush().await?;
        fh.offset += data.len() as u64;
        Ok(Reply::Written(data.len() as u16))
    }

    pub async fn seek_file(
        &self,
        session: &mut Session,
        handle: u8,
        whence_byte: u8,
        offset: u32,
    ) -> Result<Reply> {
        let fh = session.file_mut(handle)?;
        let pos = match whence_byte {
            whence::SET => fh.file.seek(SeekFrom::Start(offset as u64)).await?,
            whence::CUR => {
                fh.file
                    .seek(SeekFrom::Start(fh.offset + offset as u64))
                    .await?
            }
            whence::END => fh.file.seek(SeekFrom::End(offset as i64)).await?,
            _ => return Err(Status::Einval.into()),
        };
        fh.offset = pos;
        Ok(Reply::FilePos(pos as u32))
    }

    pub async fn close_file(&self, session: &mut Session, handle: u8) -> Result<Reply> {
        let fh = session.take_file(handle)?;
        drop(fh.file.into_std().await);
        Ok(Reply::Empty)
    }

    pub async fn stat_file(&self, path: &str) -> Result<Reply> {
        let real = self.resolve_existing(path).await?;
        let md = fs::metadata(&real).await?;
        Ok(Reply::Stat(FileStat {
            mode: md.mode() as u16,
            uid: md.uid() as u16,
            gid: md.gid() as u16,
            size: md.len() as u32,
            atime: md.atime() as u32,
            mtime: md.mtime() as u32,
            ctime: md.ctime() as u32,
        }))
    }

    pub async fn unlink_file(&self, path: &str) -> Result<Reply> {
        let real = self.resolve_parented(path).await?;
        fs::remove_file(&real).await?;
        Ok(Reply::Empty)
    }

    pub async fn rename_file(&self, from: &str, to: &str) -> Result<Reply> {
        let real_from = self.resolve_parented(from).await?;
        let real_to = self.resolve_parented(to).await?;
        fs::rename(&real_from, &real_to).await?;
        Ok(Reply::Empty)
    }

    /*
     * Directory operations
     */

    pub async fn open_dir(&self, session: &mut Session, path: &str) -> Result<Reply> {
        let slot = session.free_dir_slot().ok_or(Status::Emfile)?;
        let real = self.resolve_existing(path).await?;

        let mut entries = vec![
            special_entry(".", &real).await,
            special_entry("..", real.parent().unwrap_or(&real)).await,
        ];
        entries.extend(self.read_children(&real).await?);

        debug!("session {}: opendir {:?} -> handle {}", session.sid, real, slot);
        session.put_dir(
            slot,
            DirHandle {
                path: real,
                entries,
                position: 0,
            },
        );
        Ok(Reply::Handle(slot as u8))
    }

    pub async fn open_dir_x(
        &self,
        session: &mut Session,
        opts: DirOpts,
        sort: SortOpts,
        max_results: u16,
        pattern: &str,
        path: &str,
    ) -> Result<Reply> {
        let slot = session.free_dir_slot().ok_or(Status::Emfile)?;
        let real = self.resolve_existing(path).await?;
        let mut entries = self.read_children(&real).await?;

        entries.retain(|e| {
            if e.flags.contains(EntryFlags::HIDDEN) && !opts.contains(DirOpts::INCLUDE_HIDDEN) {
                return false;
            }
            if !pattern.is_empty() {
                let exempt =
                    e.flags.contains(EntryFlags::DIR) && !opts.contains(DirOpts::PATTERN_DIRS);
                if !exempt && !wildcard_match(pattern, &e.name) {
                    return false;
                }
            }
            true
        });

        if !sort.contains(SortOpts::NONE) {
            sort_entries(&mut entries, opts, sort);
        }

        if max_results != 0 {
            entries.truncate(max_results as usize);
        }

        if opts.contains(DirOpts::INCLUDE_SPECIAL) {
            let parent = special_entry("..", real.parent().unwrap_or(&real)).await;
            entries.insert(0, parent);
            entries.insert(0, special_entry(".", &real).await);
        }

        let count = entries.len().min(u16::MAX as usize) as u16;
        debug!(
            "session {}: opendirx {:?} pattern {:?} -> handle {} ({} entries)",
            session.sid, real, pattern, slot, count
        );
        session.put_dir(
            slot,
            DirHandle {
                path: real,
                entries,
                position: 0,
            },
        );
        Ok(Reply::DirOpened {
            handle: slot as u8,
            count,
        })
    }

    pub fn read_dir(&self, session: &mut Session, handle: u8) -> Result<Reply> {
        let dh = session.dir_mut(handle)?;
        match dh.entries.get(dh.position) {
            Some(entry) => {
                dh.position += 1;
                Ok(Reply::DirEntryName(entry.name.clone()))
            }
            None => Err(Status::Eof.into()),
        }
    }

    pub fn read_dir_x(&self, session: &mut Session, handle: u8, count: u8) -> Result<Reply> {
        let dh = session.dir_mut(handle)?;
        let dpos = dh.position.min(u16::MAX as usize) as u16;

        let mut batch = Vec::new();
        let mut size = 4;
        while dh.position < dh.entries.len() {
            if count != 0 && batch.len() >= count as usize {
                break;
            }
            let entry = &dh.entries[dh.position];
            if size + entry.wire_len() > MAX_PAYLOAD {
                break;
            }
            size += entry.wire_len();
            batch.push(entry.clone());
            dh.position += 1;
        }

        let status = if dh.position >= dh.entries.len() {
            DIRSTATUS_EOF
        } else {
            0
        };
        Ok(Reply::DirBatch {
            status,
            dpos,
            entries: batch,
        })
    }

    pub fn tell_dir(&self, session: &mut Session, handle: u8) -> Result<Reply> {
        let dh = session.dir_mut(handle)?;
        Ok(Reply::DirPos(dh.position.min(u32::MAX as usize) as u32))
    }

    pub fn seek_dir(&self, session: &mut Session, handle: u8, position: u32) -> Result<Reply> {
        let dh = session.dir_mut(handle)?;
        dh.position = (position as usize).min(dh.entries.len());
        Ok(Reply::Empty)
    }

    pub fn close_dir(&self, session: &mut Session, handle: u8) -> Result<Reply> {
        session.take_dir(handle)?;
        Ok(Reply::Empty)
    }

    pub async fn make_dir(&self, path: &str) -> Result<Reply> {
        let real = self.resolve_parented(path).await?;
        fs::create_dir(&real).await?;
        Ok(Reply::Empty)
    }

    pub async fn remove_dir(&self, path: &str) -> Result<Reply> {
        let real = self.resolve_parented(path).await?;
        fs::remove_dir(&real).await?;
        Ok(Reply::Empty)
    }

    async fn read_children(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut stream = ReadDirStream::new(fs::read_dir(dir).await?);
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            if let Some(e) = child_entry(&entry?).await {
                entries.push(e);
            }
        }
        Ok(entries)
    }
}

async fn special_entry(name: &str, path: &Path) -> DirEntry {
    let mtime = fs::metadata(path)
        .await
        .map(|md| md.mtime() as u32)
        .unwrap_or(0);
    DirEntry {
        flags: EntryFlags::DIR | EntryFlags::SPECIAL,
        size: 0,
        mtime,
        name: name.to_owned(),
    }
}

/// Entries that cannot be stat'ed are skipped rather than failing the
/// whole enumeration.
async fn child_entry(entry: &fs::DirEntry) -> Option<DirEntry> {
    let name = entry.file_name().to_string_lossy().into_owned();
    let md = fs::metadata(entry.path()).await.ok()?;

    let mut flags = EntryFlags::empty();
    if md.is_dir() {
        flags |= EntryFlags::DIR;
    }
    if name.starts_with('.') {
        flags |= EntryFlags::HIDDEN;
    }

    Some(DirEntry {
        flags,
        size: if md.is_dir() { 0 } else { md.len() },
        mtime: md.mtime() as u32,
        name,
    })
}

fn sort_entries(entries: &mut [DirEntry], opts: DirOpts, sort: SortOpts) {
    let folders_first = !opts.contains(DirOpts::NO_FOLDERS_FIRST);
    entries.sort_by(|a, b| {
        if folders_first {
            let da = a.flags.contains(EntryFlags::DIR);
            let db = b.flags.contains(EntryFlags::DIR);
            if da != db {
                return db.cmp(&da);
            }
        }
        let ord = if sort.contains(SortOpts::BY_MTIME) {
            a.mtime.cmp(&b.mtime)
        } else if sort.contains(SortOpts::BY_SIZE) {
            a.size.cmp(&b.size)
        } else if sort.contains(SortOpts::CASE_SENSITIVE) {
            a.name.cmp(&b.name)
        } else {
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        };
        if sort.contains(SortOpts::DESCENDING) {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn host_flags(flags: u16) -> OFlag {
    let mut oflags = match flags & of::ACCMODE {
        of::WRONLY => OFlag::O_WRONLY,
        of::RDWR => OFlag::O_RDWR,
        _ => OFlag::O_RDONLY,
    };
    if flags & of::APPEND != 0 {
        oflags |= OFlag::O_APPEND;
    }
    if flags & of::CREATE != 0 {
        oflags |= OFlag::O_CREAT;
    }
    if flags & of::TRUNCATE != 0 {
        oflags |= OFlag::O_TRUNC;
    }
    if flags & of::EXCLUSIVE != 0 {
        oflags |= OFlag::O_EXCL;
    }
    oflags
}

/// Shell-style name matching with `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let (p, n) = (pattern.as_bytes(), name.as_bytes());
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
