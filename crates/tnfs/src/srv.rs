//! Asynchronous TNFS datagram server.
//!
//! One task owns the socket, the session table, and the export; datagrams
//! are handled to completion in arrival order, so requests within a session
//! are never reordered and no lock discipline is needed. A `select!` arm
//! ticks the session reaper between datagrams.

use {
    crate::{
        error::{Result, Status},
        fs::Export,
        proto::{
            translate_old_flags, Cmd, Header, Reply, Request, HEADERSZ, MAX_MSGSZ, MIN_RETRY_MS,
            PROTO_VERSION_MAJOR, PROTO_VERSION_MINOR,
        },
        serialize::{encode_reply, Decodable},
        session::{Session, SessionTable, SWEEP_INTERVAL},
    },
    bytes::Bytes,
    log::{debug, error, info, warn},
    num_traits::FromPrimitive,
    std::{io, net::SocketAddr, path::Path},
    tokio::{net::UdpSocket, time},
};

/// Route a decoded session-bearing request to its handler.
async fn dispatch(export: &Export, session: &mut Session, req: Request) -> Result<Reply> {
    match req {
        Request::Mount { .. } | Request::Umount => Err(Status::Einval.into()),

        Request::OpenDir { path } => export.open_dir(session, &path).await,
        Request::ReadDir { handle } => export.read_dir(session, handle),
        Request::CloseDir { handle } => export.close_dir(session, handle),
        Request::MkDir { path } => export.make_dir(&path).await,
        Request::RmDir { path } => export.remove_dir(&path).await,
        Request::TellDir { handle } => export.tell_dir(session, handle),
        Request::SeekDir { handle, position } => export.seek_dir(session, handle, position),
        Request::OpenDirX {
            opts,
            sort,
            max_results,
            pattern,
            path,
        } => {
            export
                .open_dir_x(session, opts, sort, max_results, &pattern, &path)
                .await
        }
        Request::ReadDirX { handle, count } => export.read_dir_x(session, handle, count),

        Request::OpenFileOld { flags, path } => {
            export
                .open_file(session, translate_old_flags(flags), 0o644, &path)
                .await
        }
        Request::OpenFile { flags, mode, path } => {
            export.open_file(session, flags, mode, &path).await
        }
        Request::ReadBlock { handle, count } => export.read_block(session, handle, count).await,
        Request::WriteBlock { handle, data } => export.write_block(session, handle, &data).await,
        Request::CloseFile { handle } => export.close_file(session, handle).await,
        Request::StatFile { path } => export.stat_file(&path).await,
        Request::SeekFile {
            handle,
            whence,
            offset,
        } => export.seek_file(session, handle, whence, offset).await,
        Request::UnlinkFile { path } => export.unlink_file(&path).await,
        Request::ChmodFile { .. } => Err(Status::Enosys.into()),
        Request::RenameFile { from, to } => export.rename_file(&from, &to).await,
    }
}

fn render(hdr: &Header, status: Status, reply: &Reply) -> Option<Bytes> {
    match encode_reply(hdr, status, reply) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("failed to encode reply for cmd {:#04x}: {}", hdr.cmd, e);
            None
        }
    }
}

/// The TNFS daemon: a bound UDP socket, the exported tree, and every live
/// session.
pub struct Server {
    socket: UdpSocket,
    export: Export,
    table: SessionTable,
}

impl Server {
    /// Canonicalize and validate the export root, then bind the socket.
    pub async fn bind(root: impl AsRef<Path>, port: u16) -> Result<Server> {
        let export = Export::new(root)?;
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!(
            "serving {:?} on udp port {}",
            export.root(),
            socket.local_addr()?.port()
        );
        Ok(Server {
            socket,
            export,
            table: SessionTable::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and answer datagrams until the socket fails.
    pub async fn run(&mut self) -> Result<()> {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        let mut buf = vec![0u8; MAX_MSGSZ];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    if let Some(reply) = self.handle_datagram(&buf[..len], peer).await {
                        // Transmission is best-effort; the client retries.
                        if let Err(e) = self.socket.send_to(&reply, peer).await {
                            warn!("{}: send failed: {}", peer, e);
                        }
                    }
                }
                _ = sweep.tick() => self.table.sweep().await,
            }
        }
    }

    /// Handle one datagram and produce the reply to send back, if any.
    /// Runt datagrams and address mismatches are dropped without a reply.
    pub async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Option<Bytes> {
        if datagram.len() < HEADERSZ {
            debug!("{}: dropping runt datagram ({} bytes)", peer, datagram.len());
            return None;
        }
        let hdr = Header::decode(&mut io::Cursor::new(datagram)).ok()?;
        let payload = &datagram[HEADERSZ..];

        if hdr.cmd == Cmd::Mount as u8 {
            return self.handle_mount(&hdr, payload, peer).await;
        }
        if hdr.sid == 0 {
            debug!("{}: command {:#04x} without a session", peer, hdr.cmd);
            return None;
        }

        let unmounted = {
            let Some(session) = self.table.get_mut(hdr.sid) else {
                debug!("{}: unknown session {:#06x}", peer, hdr.sid);
                return render(&hdr, Status::Estale, &Reply::Empty);
            };
            if session.addr != peer {
                warn!(
                    "session {}: datagram from {} does not match {}",
                    hdr.sid, peer, session.addr
                );
                return None;
            }
            session.touch();
            if let Some(cached) = session.replay(hdr.seq) {
                debug!("session {}: replaying seq {}", hdr.sid, hdr.seq);
                return Some(cached);
            }
            session.is_unmounted()
        };

        // A fresh request ends the unmounted session's replay window.
        if unmounted {
            debug!("session {}: request after unmount", hdr.sid);
            self.table.destroy(hdr.sid).await;
            return render(&hdr, Status::Estale, &Reply::Empty);
        }

        let cmd = Cmd::from_u8(hdr.cmd);

        if cmd == Some(Cmd::Umount) {
            let bytes = render(&hdr, Status::Success, &Reply::Empty)?;
            if let Some(session) = self.table.get_mut(hdr.sid) {
                session.cache_reply(hdr.seq, bytes.clone());
                session.release_all().await;
                session.mark_unmounted();
            }
            info!("session {}: unmounted", hdr.sid);
            return Some(bytes);
        }

        let outcome = match cmd {
            None => {
                warn!("session {}: unknown opcode {:#04x}", hdr.sid, hdr.cmd);
                Err(Status::Enosys.into())
            }
            Some(Cmd::Mount) | Some(Cmd::Umount) => Err(Status::Einval.into()),
            Some(cmd) => match Request::decode(cmd, payload) {
                Ok(req) => {
                    debug!("session {}: seq {} {:?}", hdr.sid, hdr.seq, cmd);
                    let session = self.table.get_mut(hdr.sid)?;
                    dispatch(&self.export, session, req).await
                }
                Err(e) => {
                    debug!("session {}: malformed {:?} payload: {}", hdr.sid, cmd, e);
                    Err(Status::Einval.into())
                }
            },
        };

        let (status, reply) = match outcome {
            Ok(Reply::EndOfFile) => (Status::Eof, Reply::EndOfFile),
            Ok(reply) => (Status::Success, reply),
            Err(e) => (e.status(), Reply::Empty),
        };

        let bytes = render(&hdr, status, &reply)?;
        self.table
            .get_mut(hdr.sid)?
            .cache_reply(hdr.seq, bytes.clone());
        Some(bytes)
    }

    async fn handle_mount(&mut self, hdr: &Header, payload: &[u8], peer: SocketAddr) -> Option<Bytes> {
        if hdr.sid != 0 {
            return render(hdr, Status::Einval, &Reply::Empty);
        }

        let (version, path) = match Request::decode(Cmd::Mount, payload) {
            Ok(Request::Mount { version, path, .. }) => (version, path),
            _ => {
                debug!("{}: malformed mount payload", peer);
                return render(hdr, Status::Einval, &Reply::Empty);
            }
        };

        if let Err(e) = self.export.resolve(&path) {
            return render(hdr, e.status(), &Reply::Empty);
        }

        if let Some(old) = self.table.find_by_addr(peer) {
            info!("session {}: superseded by a new mount from {}", old, peer);
            self.table.destroy(old).await;
        }

        let sid = match self.table.allocate(peer, version, path) {
            Ok(session) => session.sid,
            Err(e) => return render(hdr, e.status(), &Reply::Empty),
        };

        debug!(
            "session {}: client speaks protocol {}.{}",
            sid,
            version >> 8,
            version & 0xff
        );
        let reply_hdr = Header { sid, ..*hdr };
        render(
            &reply_hdr,
            Status::Success,
            &Reply::Mount {
                version_minor: PROTO_VERSION_MINOR,
                version_major: PROTO_VERSION_MAJOR,
                retry_ms: MIN_RETRY_MS,
            },
        )
    }
}
