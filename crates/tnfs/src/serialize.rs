//! Serialize/deserialize TNFS messages into/from binary.
//!
//! All multi-byte integers are little-endian. Strings travel as raw bytes
//! followed by a NUL terminator; invalid UTF-8 is replaced rather than
//! rejected, since 8-bit clients are loose about encodings.

use crate::error::Status;
use crate::proto::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{self, Cursor, Result};
use std::mem;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: io::Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        loop {
            match r.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Like `String::decode` but an exhausted reader counts as the empty
/// string. MOUNT's trailing user/password fields are optional on the wire.
fn zstring_lenient<R: ReadBytesExt>(r: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        match r.read_u8() {
            Ok(0) => break,
            Ok(b) => bytes.push(b),
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof && bytes.is_empty() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl Encodable for Header {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(self.sid.encode(w)? + self.seq.encode(w)? + self.cmd.encode(w)?)
    }
}

impl Decodable for Header {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Header {
            sid: decode!(*r),
            seq: decode!(*r),
            cmd: decode!(*r),
        })
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(self.flags.bits().encode(w)?
            + self.size.encode(w)?
            + self.mtime.encode(w)?
            + self.name.encode(w)?)
    }
}

impl Encodable for FileStat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(self.mode.encode(w)?
            + self.uid.encode(w)?
            + self.gid.encode(w)?
            + self.size.encode(w)?
            + self.atime.encode(w)?
            + self.mtime.encode(w)?
            + self.ctime.encode(w)?)
    }
}

impl Request {
    /// Decode a request payload for a known opcode. Any shortfall or
    /// missing terminator surfaces as an error the dispatcher reports as
    /// an invalid argument.
    pub fn decode(cmd: Cmd, payload: &[u8]) -> Result<Request> {
        let mut r = Cursor::new(payload);

        let req = match cmd {
            Cmd::Mount => {
                let version = decode!(r);
                let path = decode!(r);
                let user = zstring_lenient(&mut r)?;
                let password = zstring_lenient(&mut r)?;
                Request::Mount {
                    version,
                    path,
                    user,
                    password,
                }
            }
            Cmd::Umount => Request::Umount,

            Cmd::OpenDir => Request::OpenDir { path: decode!(r) },
            Cmd::ReadDir => Request::ReadDir { handle: decode!(r) },
            Cmd::CloseDir => Request::CloseDir { handle: decode!(r) },
            Cmd::MkDir => Request::MkDir { path: decode!(r) },
            Cmd::RmDir => Request::RmDir { path: decode!(r) },
            Cmd::TellDir => Request::TellDir { handle: decode!(r) },
            Cmd::SeekDir => Request::SeekDir {
                handle: decode!(r),
                position: decode!(r),
            },
            Cmd::OpenDirX => Request::OpenDirX {
                opts: decode!(DirOpts, r),
                sort: decode!(SortOpts, r),
                max_results: decode!(r),
                pattern: decode!(r),
                path: decode!(r),
            },
            Cmd::ReadDirX => Request::ReadDirX {
                handle: decode!(r),
                count: decode!(r),
            },

            Cmd::OpenFileOld => Request::OpenFileOld {
                flags: decode!(r),
                path: decode!(r),
            },
            Cmd::OpenFile => Request::OpenFile {
                flags: decode!(r),
                mode: decode!(r),
                path: decode!(r),
            },
            Cmd::ReadBlock => Request::ReadBlock {
                handle: decode!(r),
                count: decode!(r),
            },
            Cmd::WriteBlock => {
                let handle = decode!(r);
                let count: u16 = decode!(r);
                let data = read_exact(&mut r, count as usize)?;
                Request::WriteBlock { handle, data }
            }
            Cmd::CloseFile => Request::CloseFile { handle: decode!(r) },
            Cmd::StatFile => Request::StatFile { path: decode!(r) },
            Cmd::SeekFile => Request::SeekFile {
                handle: decode!(r),
                whence: decode!(r),
                offset: decode!(r),
            },
            Cmd::UnlinkFile => Request::UnlinkFile { path: decode!(r) },
            Cmd::ChmodFile => Request::ChmodFile {
                mode: decode!(r),
                path: decode!(r),
            },
            Cmd::RenameFile => Request::RenameFile {
                from: decode!(r),
                to: decode!(r),
            },
        };

        Ok(req)
    }
}

impl Encodable for Reply {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self {
            Reply::Empty => Ok(0),
            Reply::Mount {
                version_minor,
                version_major,
                retry_ms,
            } => Ok(version_minor.encode(w)? + version_major.encode(w)? + retry_ms.encode(w)?),
            Reply::Handle(handle) => handle.encode(w),
            Reply::DirOpened { handle, count } => Ok(handle.encode(w)? + count.encode(w)?),
            Reply::DirEntryName(name) => name.encode(w),
            Reply::DirPos(pos) => pos.encode(w),
            Reply::DirBatch {
                status,
                dpos,
                entries,
            } => {
                let mut n = (entries.len() as u8).encode(w)?;
                n += status.encode(w)?;
                n += dpos.encode(w)?;
                for entry in entries {
                    n += entry.encode(w)?;
                }
                Ok(n)
            }
            Reply::Block(data) => {
                let n = (data.len() as u16).encode(w)?;
                w.write_all(data)?;
                Ok(n + data.len())
            }
            Reply::EndOfFile => 0u16.encode(w),
            Reply::Written(count) => count.encode(w),
            Reply::FilePos(pos) => pos.encode(w),
            Reply::Stat(stat) => stat.encode(w),
        }
    }
}

/// Assemble a complete reply datagram: header, status byte, body.
pub fn encode_reply(hdr: &Header, status: Status, reply: &Reply) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(MAX_MSGSZ);
    hdr.encode(&mut buf)?;
    (status as u8).encode(&mut buf)?;
    reply.encode(&mut buf)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        for sid in [0u16, 1, 0xbeef, u16::MAX] {
            for seq in [0u8, 7, 255] {
                let expected = Header {
                    sid,
                    seq,
                    cmd: Cmd::ReadBlock as u8,
                };
                let mut buf = Vec::new();
                expected.encode(&mut buf).unwrap();
                assert_eq!(buf.len(), HEADERSZ);

                let actual = Header::decode(&mut Cursor::new(buf)).unwrap();
                assert_eq!(expected, actual);
            }
        }
    }

    #[test]
    fn header_is_little_endian() {
        let mut buf = Vec::new();
        Header {
            sid: 0x1234,
            seq: 0x56,
            cmd: 0x21,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(buf, [0x34, 0x12, 0x56, 0x21]);
    }

    #[test]
    fn zstring_roundtrip() {
        let mut buf = Vec::new();
        String::from("a.txt").encode(&mut buf).unwrap();
        assert_eq!(buf, b"a.txt\0");

        let s = String::decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(s, "a.txt");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(String::decode(&mut Cursor::new(b"oops".to_vec())).is_err());
    }

    #[test]
    fn mount_request_decode() {
        // version 1.2, path "/", no user, no password
        let payload = b"\x02\x01/\0\0\0";
        let req = Request::decode(Cmd::Mount, payload).unwrap();
        assert_eq!(
            req,
            Request::Mount {
                version: 0x0102,
                path: "/".into(),
                user: "".into(),
                password: "".into(),
            }
        );

        // trailing credentials may be absent entirely
        let req = Request::decode(Cmd::Mount, b"\x02\x01/games\0").unwrap();
        assert_eq!(
            req,
            Request::Mount {
                version: 0x0102,
                path: "/games".into(),
                user: "".into(),
                password: "".into(),
            }
        );
    }

    #[test]
    fn write_block_decode_takes_exactly_count_bytes() {
        let req = Request::decode(Cmd::WriteBlock, b"\x02\x05\x00HELLO").unwrap();
        assert_eq!(
            req,
            Request::WriteBlock {
                handle: 2,
                data: b"HELLO".to_vec(),
            }
        );

        assert!(Request::decode(Cmd::WriteBlock, b"\x02\x06\x00HELLO").is_err());
    }

    #[test]
    fn open_dir_x_decode() {
        let req = Request::decode(Cmd::OpenDirX, b"\x02\x04\x10\x00*.txt\0/docs\0").unwrap();
        assert_eq!(
            req,
            Request::OpenDirX {
                opts: DirOpts::INCLUDE_HIDDEN,
                sort: SortOpts::DESCENDING,
                max_results: 16,
                pattern: "*.txt".into(),
                path: "/docs".into(),
            }
        );
    }

    #[test]
    fn mount_reply_bytes() {
        let reply = Reply::Mount {
            version_minor: PROTO_VERSION_MINOR,
            version_major: PROTO_VERSION_MAJOR,
            retry_ms: MIN_RETRY_MS,
        };
        let buf = encode_reply(
            &Header {
                sid: 0xcafe,
                seq: 1,
                cmd: Cmd::Mount as u8,
            },
            Status::Success,
            &reply,
        )
        .unwrap();
        assert_eq!(
            &buf[..],
            [0xfe, 0xca, 0x01, 0x00, 0x00, 0x02, 0x01, 0xe8, 0x03]
        );
    }

    #[test]
    fn dir_batch_encoding() {
        let reply = Reply::DirBatch {
            status: DIRSTATUS_EOF,
            dpos: 3,
            entries: vec![DirEntry {
                flags: EntryFlags::DIR | EntryFlags::HIDDEN,
                size: 0x0102030405060708,
                mtime: 0x11223344,
                name: "x".into(),
            }],
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x01, // count
                0x01, // dir status: EOF
                0x03, 0x00, // starting position
                0x03, // entry flags
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // size
                0x44, 0x33, 0x22, 0x11, // mtime
                b'x', 0x00, // name
            ]
        );
    }

    #[test]
    fn end_of_file_reply_carries_zero_count() {
        let buf = encode_reply(
            &Header {
                sid: 1,
                seq: 9,
                cmd: Cmd::ReadBlock as u8,
            },
            Status::Eof,
            &Reply::EndOfFile,
        )
        .unwrap();
        assert_eq!(&buf[..], [0x01, 0x00, 0x09, 0x21, 0x21, 0x00, 0x00]);
    }

    #[test]
    fn stat_reply_layout() {
        let mut buf = Vec::new();
        Reply::Stat(FileStat {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            size: 100,
            atime: 1,
            mtime: 2,
            ctime: 3,
        })
        .encode(&mut buf)
        .unwrap();
        assert_eq!(buf.len(), 2 + 2 + 2 + 4 + 4 + 4 + 4);
        assert_eq!(&buf[..2], (0o644u16).to_le_bytes());
        assert_eq!(&buf[6..10], 100u32.to_le_bytes());
    }
}
