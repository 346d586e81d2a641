// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! hauntty-protocol defines the wire protocol hauntty uses to talk between
//! its client and daemon processes. You almost certainly don't need to use
//! it directly.
//!
//! The wire format is a length-prefixed frame codec rather than a
//! serde-based encoding: a `u32` frame length (big endian) followed by that
//! many bytes of payload, whose first byte is a message type tag. Scalars
//! are big endian; strings are `u16`-length-prefixed UTF-8 capped at 65535
//! bytes; byte blobs are `u32`-length-prefixed; optional fields are preceded
//! by a one byte presence flag.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

pub const PROTOCOL_VERSION: u8 = 1;
pub const PROTOCOL_REVISION: &str = env!("CARGO_PKG_VERSION");

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The maximum number of bytes a wire `string` field may hold.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

// ---------------------------------------------------------------------
// low level scalar/frame codec
// ---------------------------------------------------------------------

/// Reads one length-prefixed frame off of `r`, returning its raw payload
/// bytes (tag byte included). Rejects zero-length and oversized frames.
pub fn read_frame<R: Read>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>().context("reading frame length")?;
    if len == 0 {
        return Err(anyhow!("empty frame"));
    }
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_LEN));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).context("reading frame payload")?;
    Ok(buf)
}

/// Writes `payload` as one length-prefixed frame to `w`.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    if payload.is_empty() {
        return Err(anyhow!("refusing to write an empty frame"));
    }
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(anyhow!("frame of {} bytes exceeds {} byte limit", payload.len(), MAX_FRAME_LEN));
    }
    w.write_u32::<BigEndian>(payload.len() as u32).context("writing frame length")?;
    w.write_all(payload).context("writing frame payload")?;
    Ok(())
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}
pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}
pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<BigEndian>(v)
}
pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<BigEndian>()
}
pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(v)
}
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<BigEndian>()
}
pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_i32::<BigEndian>(v)
}
pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    r.read_i32::<BigEndian>()
}
pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<BigEndian>(v)
}
pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<BigEndian>()
}
pub fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
    w.write_u8(if v { 1 } else { 0 })
}
pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    Ok(r.read_u8()? != 0)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> anyhow::Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(anyhow!("string of {} bytes exceeds {} byte limit", s.len(), MAX_STRING_LEN));
    }
    write_u16(w, s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}
pub fn read_string<R: Read>(r: &mut R) -> anyhow::Result<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("reading string bytes")?;
    String::from_utf8(buf).context("string field was not valid utf8")
}

pub fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> anyhow::Result<()> {
    write_u32(w, b.len() as u32)?;
    w.write_all(b)?;
    Ok(())
}
pub fn read_bytes<R: Read>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len as u32 > MAX_FRAME_LEN {
        return Err(anyhow!("byte field of {} bytes exceeds {} byte limit", len, MAX_FRAME_LEN));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("reading byte field")?;
    Ok(buf)
}

pub fn write_string_vec<W: Write>(w: &mut W, v: &[String]) -> anyhow::Result<()> {
    write_u16(w, v.len() as u16)?;
    for s in v {
        write_string(w, s)?;
    }
    Ok(())
}
pub fn read_string_vec<R: Read>(r: &mut R) -> anyhow::Result<Vec<String>> {
    let n = read_u16(r)?;
    (0..n).map(|_| read_string(r)).collect()
}

pub fn write_option_string<W: Write>(w: &mut W, v: &Option<String>) -> anyhow::Result<()> {
    match v {
        Some(s) => {
            write_bool(w, true)?;
            write_string(w, s)
        }
        None => write_bool(w, false).map_err(Into::into),
    }
}
pub fn read_option_string<R: Read>(r: &mut R) -> anyhow::Result<Option<String>> {
    if read_bool(r)? { Ok(Some(read_string(r)?)) } else { Ok(None) }
}

pub fn write_option_u64<W: Write>(w: &mut W, v: Option<u64>) -> anyhow::Result<()> {
    match v {
        Some(n) => {
            write_bool(w, true)?;
            write_u64(w, n)?;
        }
        None => write_bool(w, false)?,
    }
    Ok(())
}
pub fn read_option_u64<R: Read>(r: &mut R) -> anyhow::Result<Option<u64>> {
    if read_bool(r)? { Ok(Some(read_u64(r)?)) } else { Ok(None) }
}

// ---------------------------------------------------------------------
// handshake
// ---------------------------------------------------------------------

/// Sent once by the client immediately after connecting, and echoed back
/// (with the daemon's own version/revision) by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub revision: String,
}

impl Handshake {
    pub fn write_to<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        let mut body = Vec::new();
        write_u8(&mut body, self.version)?;
        write_string(&mut body, &self.revision)?;
        write_frame(w, &body)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Handshake> {
        let body = read_frame(r)?;
        let mut cur = io::Cursor::new(body);
        let version = read_u8(&mut cur)?;
        let revision = read_string(&mut cur)?;
        Ok(Handshake { version, revision })
    }
}

// ---------------------------------------------------------------------
// shared value types
// ---------------------------------------------------------------------

/// Window geometry, including optional pixel extents for apps that care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WinSize {
    pub cols: u16,
    pub rows: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl WinSize {
    fn write(&self, w: &mut impl Write) -> anyhow::Result<()> {
        write_u16(w, self.cols)?;
        write_u16(w, self.rows)?;
        write_u16(w, self.xpixel)?;
        write_u16(w, self.ypixel)?;
        Ok(())
    }
    fn read(r: &mut impl Read) -> anyhow::Result<WinSize> {
        Ok(WinSize {
            cols: read_u16(r)?,
            rows: read_u16(r)?,
            xpixel: read_u16(r)?,
            ypixel: read_u16(r)?,
        })
    }
}

/// What happened when `Create` resolved a session name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Existing,
}

/// How a client wants `Create` to treat a name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    RequireNew,
    OpenOrCreate,
}

impl CreateMode {
    fn to_u8(self) -> u8 {
        match self {
            CreateMode::RequireNew => 1,
            CreateMode::OpenOrCreate => 2,
        }
    }
    fn from_u8(v: u8) -> anyhow::Result<CreateMode> {
        match v {
            1 => Ok(CreateMode::RequireNew),
            2 => Ok(CreateMode::OpenOrCreate),
            _ => Err(anyhow!("unknown create mode {}", v)),
        }
    }
}

/// Session liveness as reported to `List`/`Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Dead,
}

impl SessionState {
    fn to_u8(self) -> u8 {
        match self {
            SessionState::Running => 1,
            SessionState::Dead => 2,
        }
    }
    fn from_u8(v: u8) -> anyhow::Result<SessionState> {
        match v {
            1 => Ok(SessionState::Running),
            2 => Ok(SessionState::Dead),
            _ => Err(anyhow!("unknown session state {}", v)),
        }
    }
}

/// One row of a `Sessions` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    pub state: SessionState,
    pub cols: u16,
    pub rows: u16,
    pub pid: u32,
    pub created_at_unix_secs: u64,
    pub cwd: Option<String>,
    pub clients: Option<Vec<ClientEntry>>,
}

impl SessionEntry {
    fn write(&self, w: &mut impl Write) -> anyhow::Result<()> {
        write_string(w, &self.name)?;
        write_u8(w, self.state.to_u8())?;
        write_u16(w, self.cols)?;
        write_u16(w, self.rows)?;
        write_u32(w, self.pid)?;
        write_u64(w, self.created_at_unix_secs)?;
        write_option_string(w, &self.cwd)?;
        match &self.clients {
            Some(cs) => {
                write_bool(w, true)?;
                write_u16(w, cs.len() as u16)?;
                for c in cs {
                    c.write(w)?;
                }
            }
            None => write_bool(w, false)?,
        }
        Ok(())
    }
    fn read(r: &mut impl Read) -> anyhow::Result<SessionEntry> {
        let name = read_string(r)?;
        let state = SessionState::from_u8(read_u8(r)?)?;
        let cols = read_u16(r)?;
        let rows = read_u16(r)?;
        let pid = read_u32(r)?;
        let created_at_unix_secs = read_u64(r)?;
        let cwd = read_option_string(r)?;
        let clients = if read_bool(r)? {
            let n = read_u16(r)?;
            let mut v = Vec::with_capacity(n as usize);
            for _ in 0..n {
                v.push(ClientEntry::read(r)?);
            }
            Some(v)
        } else {
            None
        };
        Ok(SessionEntry { name, state, cols, rows, pid, created_at_unix_secs, cwd, clients })
    }
}

/// One attached client, as reported in a `Sessions` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub id: String,
    pub tty: Option<String>,
    pub read_only: bool,
    pub version: String,
}

impl ClientEntry {
    fn write(&self, w: &mut impl Write) -> anyhow::Result<()> {
        write_string(w, &self.id)?;
        write_option_string(w, &self.tty)?;
        write_bool(w, self.read_only)?;
        write_string(w, &self.version)?;
        Ok(())
    }
    fn read(r: &mut impl Read) -> anyhow::Result<ClientEntry> {
        Ok(ClientEntry {
            id: read_string(r)?,
            tty: read_option_string(r)?,
            read_only: read_bool(r)?,
            version: read_string(r)?,
        })
    }
}

/// Daemon-wide counters returned by `Status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub pid: u32,
    pub uptime_secs: u64,
    pub socket_path: String,
    pub running_count: u32,
    pub dead_count: u32,
    pub version: String,
}

impl DaemonStatus {
    fn write(&self, w: &mut impl Write) -> anyhow::Result<()> {
        write_u32(w, self.pid)?;
        write_u64(w, self.uptime_secs)?;
        write_string(w, &self.socket_path)?;
        write_u32(w, self.running_count)?;
        write_u32(w, self.dead_count)?;
        write_string(w, &self.version)?;
        Ok(())
    }
    fn read(r: &mut impl Read) -> anyhow::Result<DaemonStatus> {
        Ok(DaemonStatus {
            pid: read_u32(r)?,
            uptime_secs: read_u64(r)?,
            socket_path: read_string(r)?,
            running_count: read_u32(r)?,
            dead_count: read_u32(r)?,
            version: read_string(r)?,
        })
    }
}

// ---------------------------------------------------------------------
// client -> daemon requests
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub mode: CreateMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub name: String,
    pub size: WinSize,
    pub read_only: bool,
    pub client_tty: Option<String>,
    pub attach_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachRequest {
    pub name: String,
    pub target_client_id: Option<String>,
    pub target_tty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub include_clients: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendKeyRequest {
    pub name: String,
    pub key_code: u32,
    pub mods: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub name: String,
    pub format: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create(CreateRequest),
    Attach(AttachRequest),
    Input { data: Vec<u8> },
    Resize(WinSize),
    Detach(DetachRequest),
    List(ListRequest),
    Kill { name: String },
    Send { name: String, data: Vec<u8> },
    SendKey(SendKeyRequest),
    Dump(DumpRequest),
    Prune,
    Status { session_name: Option<String> },
}

mod req_tag {
    pub const CREATE: u8 = 1;
    pub const ATTACH: u8 = 2;
    pub const INPUT: u8 = 3;
    pub const RESIZE: u8 = 4;
    pub const DETACH: u8 = 5;
    pub const LIST: u8 = 6;
    pub const KILL: u8 = 7;
    pub const SEND: u8 = 8;
    pub const SEND_KEY: u8 = 9;
    pub const DUMP: u8 = 10;
    pub const PRUNE: u8 = 11;
    pub const STATUS: u8 = 12;
}

impl Request {
    pub fn write_to<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        let mut body = Vec::new();
        match self {
            Request::Create(c) => {
                write_u8(&mut body, req_tag::CREATE)?;
                write_string(&mut body, &c.name)?;
                write_string_vec(&mut body, &c.command)?;
                write_string_vec(&mut body, &c.env)?;
                write_option_string(&mut body, &c.cwd)?;
                write_u8(&mut body, c.mode.to_u8())?;
            }
            Request::Attach(a) => {
                write_u8(&mut body, req_tag::ATTACH)?;
                write_string(&mut body, &a.name)?;
                a.size.write(&mut body)?;
                write_bool(&mut body, a.read_only)?;
                write_option_string(&mut body, &a.client_tty)?;
                write_option_string(&mut body, &a.attach_token)?;
            }
            Request::Input { data } => {
                write_u8(&mut body, req_tag::INPUT)?;
                write_bytes(&mut body, data)?;
            }
            Request::Resize(size) => {
                write_u8(&mut body, req_tag::RESIZE)?;
                size.write(&mut body)?;
            }
            Request::Detach(d) => {
                write_u8(&mut body, req_tag::DETACH)?;
                write_string(&mut body, &d.name)?;
                write_option_string(&mut body, &d.target_client_id)?;
                write_option_string(&mut body, &d.target_tty)?;
            }
            Request::List(l) => {
                write_u8(&mut body, req_tag::LIST)?;
                write_bool(&mut body, l.include_clients)?;
            }
            Request::Kill { name } => {
                write_u8(&mut body, req_tag::KILL)?;
                write_string(&mut body, name)?;
            }
            Request::Send { name, data } => {
                write_u8(&mut body, req_tag::SEND)?;
                write_string(&mut body, name)?;
                write_bytes(&mut body, data)?;
            }
            Request::SendKey(k) => {
                write_u8(&mut body, req_tag::SEND_KEY)?;
                write_string(&mut body, &k.name)?;
                write_u32(&mut body, k.key_code)?;
                write_u32(&mut body, k.mods)?;
            }
            Request::Dump(d) => {
                write_u8(&mut body, req_tag::DUMP)?;
                write_string(&mut body, &d.name)?;
                write_u8(&mut body, d.format)?;
            }
            Request::Prune => {
                write_u8(&mut body, req_tag::PRUNE)?;
            }
            Request::Status { session_name } => {
                write_u8(&mut body, req_tag::STATUS)?;
                write_option_string(&mut body, session_name)?;
            }
        }
        write_frame(w, &body)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Request> {
        let body = read_frame(r)?;
        let mut cur = io::Cursor::new(body);
        let tag = read_u8(&mut cur)?;
        Ok(match tag {
            req_tag::CREATE => Request::Create(CreateRequest {
                name: read_string(&mut cur)?,
                command: read_string_vec(&mut cur)?,
                env: read_string_vec(&mut cur)?,
                cwd: read_option_string(&mut cur)?,
                mode: CreateMode::from_u8(read_u8(&mut cur)?)?,
            }),
            req_tag::ATTACH => Request::Attach(AttachRequest {
                name: read_string(&mut cur)?,
                size: WinSize::read(&mut cur)?,
                read_only: read_bool(&mut cur)?,
                client_tty: read_option_string(&mut cur)?,
                attach_token: read_option_string(&mut cur)?,
            }),
            req_tag::INPUT => Request::Input { data: read_bytes(&mut cur)? },
            req_tag::RESIZE => Request::Resize(WinSize::read(&mut cur)?),
            req_tag::DETACH => Request::Detach(DetachRequest {
                name: read_string(&mut cur)?,
                target_client_id: read_option_string(&mut cur)?,
                target_tty: read_option_string(&mut cur)?,
            }),
            req_tag::LIST => Request::List(ListRequest { include_clients: read_bool(&mut cur)? }),
            req_tag::KILL => Request::Kill { name: read_string(&mut cur)? },
            req_tag::SEND => {
                Request::Send { name: read_string(&mut cur)?, data: read_bytes(&mut cur)? }
            }
            req_tag::SEND_KEY => Request::SendKey(SendKeyRequest {
                name: read_string(&mut cur)?,
                key_code: read_u32(&mut cur)?,
                mods: read_u32(&mut cur)?,
            }),
            req_tag::DUMP => {
                Request::Dump(DumpRequest { name: read_string(&mut cur)?, format: read_u8(&mut cur)? })
            }
            req_tag::PRUNE => Request::Prune,
            req_tag::STATUS => Request::Status { session_name: read_option_string(&mut cur)? },
            other => return Err(anyhow!("unknown request tag {}", other)),
        })
    }
}

// ---------------------------------------------------------------------
// daemon -> client responses
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedResponse {
    pub session_name: String,
    pub pid: u32,
    pub outcome: CreateOutcome,
    pub attach_token: String,
    pub attach_token_expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedResponse {
    pub session_name: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: u32,
    pub client_id: String,
    pub screen_dump: Vec<u8>,
    pub cursor_row: u32,
    pub cursor_col: u32,
    pub is_alternate_screen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientsChanged {
    pub count: u16,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub daemon: DaemonStatus,
    pub session: Option<SessionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error { message: String },
    Output { data: Vec<u8> },
    Created(CreatedResponse),
    Attached(AttachedResponse),
    Sessions { entries: Vec<SessionEntry> },
    Exited { exit_code: i32 },
    DumpResponse { data: Vec<u8> },
    PruneResponse { count: u32 },
    ClientsChanged(ClientsChanged),
    StatusResponse(StatusResponse),
}

mod resp_tag {
    pub const OK: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const OUTPUT: u8 = 3;
    pub const CREATED: u8 = 4;
    pub const ATTACHED: u8 = 5;
    pub const SESSIONS: u8 = 6;
    pub const EXITED: u8 = 7;
    pub const DUMP_RESPONSE: u8 = 8;
    pub const PRUNE_RESPONSE: u8 = 9;
    pub const CLIENTS_CHANGED: u8 = 10;
    pub const STATUS_RESPONSE: u8 = 11;
}

impl Response {
    pub fn write_to<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        let mut body = Vec::new();
        match self {
            Response::Ok => write_u8(&mut body, resp_tag::OK)?,
            Response::Error { message } => {
                write_u8(&mut body, resp_tag::ERROR)?;
                write_string(&mut body, message)?;
            }
            Response::Output { data } => {
                write_u8(&mut body, resp_tag::OUTPUT)?;
                write_bytes(&mut body, data)?;
            }
            Response::Created(c) => {
                write_u8(&mut body, resp_tag::CREATED)?;
                write_string(&mut body, &c.session_name)?;
                write_u32(&mut body, c.pid)?;
                write_u8(
                    &mut body,
                    match c.outcome {
                        CreateOutcome::Created => 1,
                        CreateOutcome::Existing => 2,
                    },
                )?;
                write_string(&mut body, &c.attach_token)?;
                write_u64(&mut body, c.attach_token_expires_at_ms)?;
            }
            Response::Attached(a) => {
                write_u8(&mut body, resp_tag::ATTACHED)?;
                write_string(&mut body, &a.session_name)?;
                write_u16(&mut body, a.cols)?;
                write_u16(&mut body, a.rows)?;
                write_u32(&mut body, a.pid)?;
                write_string(&mut body, &a.client_id)?;
                write_bytes(&mut body, &a.screen_dump)?;
                write_u32(&mut body, a.cursor_row)?;
                write_u32(&mut body, a.cursor_col)?;
                write_bool(&mut body, a.is_alternate_screen)?;
            }
            Response::Sessions { entries } => {
                write_u8(&mut body, resp_tag::SESSIONS)?;
                write_u16(&mut body, entries.len() as u16)?;
                for e in entries {
                    e.write(&mut body)?;
                }
            }
            Response::Exited { exit_code } => {
                write_u8(&mut body, resp_tag::EXITED)?;
                write_i32(&mut body, *exit_code)?;
            }
            Response::DumpResponse { data } => {
                write_u8(&mut body, resp_tag::DUMP_RESPONSE)?;
                write_bytes(&mut body, data)?;
            }
            Response::PruneResponse { count } => {
                write_u8(&mut body, resp_tag::PRUNE_RESPONSE)?;
                write_u32(&mut body, *count)?;
            }
            Response::ClientsChanged(c) => {
                write_u8(&mut body, resp_tag::CLIENTS_CHANGED)?;
                write_u16(&mut body, c.count)?;
                write_u16(&mut body, c.cols)?;
                write_u16(&mut body, c.rows)?;
            }
            Response::StatusResponse(s) => {
                write_u8(&mut body, resp_tag::STATUS_RESPONSE)?;
                s.daemon.write(&mut body)?;
                match &s.session {
                    Some(se) => {
                        write_bool(&mut body, true)?;
                        se.write(&mut body)?;
                    }
                    None => write_bool(&mut body, false)?,
                }
            }
        }
        write_frame(w, &body)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Response> {
        let body = read_frame(r)?;
        let mut cur = io::Cursor::new(body);
        let tag = read_u8(&mut cur)?;
        Ok(match tag {
            resp_tag::OK => Response::Ok,
            resp_tag::ERROR => Response::Error { message: read_string(&mut cur)? },
            resp_tag::OUTPUT => Response::Output { data: read_bytes(&mut cur)? },
            resp_tag::CREATED => Response::Created(CreatedResponse {
                session_name: read_string(&mut cur)?,
                pid: read_u32(&mut cur)?,
                outcome: match read_u8(&mut cur)? {
                    1 => CreateOutcome::Created,
                    2 => CreateOutcome::Existing,
                    other => return Err(anyhow!("unknown create outcome {}", other)),
                },
                attach_token: read_string(&mut cur)?,
                attach_token_expires_at_ms: read_u64(&mut cur)?,
            }),
            resp_tag::ATTACHED => Response::Attached(AttachedResponse {
                session_name: read_string(&mut cur)?,
                cols: read_u16(&mut cur)?,
                rows: read_u16(&mut cur)?,
                pid: read_u32(&mut cur)?,
                client_id: read_string(&mut cur)?,
                screen_dump: read_bytes(&mut cur)?,
                cursor_row: read_u32(&mut cur)?,
                cursor_col: read_u32(&mut cur)?,
                is_alternate_screen: read_bool(&mut cur)?,
            }),
            resp_tag::SESSIONS => {
                let n = read_u16(&mut cur)?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    entries.push(SessionEntry::read(&mut cur)?);
                }
                Response::Sessions { entries }
            }
            resp_tag::EXITED => Response::Exited { exit_code: read_i32(&mut cur)? },
            resp_tag::DUMP_RESPONSE => Response::DumpResponse { data: read_bytes(&mut cur)? },
            resp_tag::PRUNE_RESPONSE => Response::PruneResponse { count: read_u32(&mut cur)? },
            resp_tag::CLIENTS_CHANGED => Response::ClientsChanged(ClientsChanged {
                count: read_u16(&mut cur)?,
                cols: read_u16(&mut cur)?,
                rows: read_u16(&mut cur)?,
            }),
            resp_tag::STATUS_RESPONSE => {
                let daemon = DaemonStatus::read(&mut cur)?;
                let session = if read_bool(&mut cur)? { Some(SessionEntry::read(&mut cur)?) } else { None };
                Response::StatusResponse(StatusResponse { daemon, session })
            }
            other => return Err(anyhow!("unknown response tag {}", other)),
        })
    }
}

// ---------------------------------------------------------------------
// resize arbitration policy, shared between client dims and server logic
// ---------------------------------------------------------------------

/// How the session's effective size is chosen when multiple clients are
/// attached with different desired geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizePolicy {
    #[default]
    Smallest,
    Largest,
    First,
    Last,
}

impl ResizePolicy {
    pub fn parse(s: &str) -> anyhow::Result<ResizePolicy> {
        match s {
            "smallest" => Ok(ResizePolicy::Smallest),
            "largest" => Ok(ResizePolicy::Largest),
            "first" => Ok(ResizePolicy::First),
            "last" => Ok(ResizePolicy::Last),
            _ => Err(anyhow!("unknown resize policy {:?}", s)),
        }
    }

    /// Arbitrates a non-empty list of desired window sizes down to one
    /// effective size. Panics if `dims` is empty — callers always have at
    /// least one attached client when arbitrating.
    pub fn arbitrate(self, dims: &[WinSize]) -> WinSize {
        assert!(!dims.is_empty(), "arbitrate called with no attached clients");
        match self {
            ResizePolicy::First => dims[0],
            ResizePolicy::Last => dims[dims.len() - 1],
            ResizePolicy::Smallest => dims.iter().copied().fold(dims[0], |acc, d| WinSize {
                cols: acc.cols.min(d.cols),
                rows: acc.rows.min(d.rows),
                xpixel: acc.xpixel.min(d.xpixel),
                ypixel: acc.ypixel.min(d.ypixel),
            }),
            ResizePolicy::Largest => dims.iter().copied().fold(dims[0], |acc, d| WinSize {
                cols: acc.cols.max(d.cols),
                rows: acc.rows.max(d.rows),
                xpixel: acc.xpixel.max(d.xpixel),
                ypixel: acc.ypixel.max(d.ypixel),
            }),
        }
    }
}
