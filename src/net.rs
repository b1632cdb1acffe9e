//! Wire protocol.
//!
//! Fixed little-endian framing, one response per request:
//!
//! ```text
//! request:  cmd u8 | id u64 | rid u64 | len u16 | payload
//! response: cmd u8 | id u64 | error i32 | len u16 | payload
//! ```
//!
//! Payload structs are the plain-old-data types from `format`.  The server
//! validates payload lengths per command and answers unknown commands or
//! malformed payloads with `-EINVAL`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::format::{
    LogTrees, NetGreeting, NetInodeAlloc, NetLock, NetRoots, OpenInoMap, OpenInoMapArgs,
    SrchCompact, VolumeOptions, FORMAT_VERS, GREETING_FLAG_QUORUM,
};

pub const MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Greeting = 1,
    AllocInodes = 2,
    GetLogTrees = 3,
    CommitLogTrees = 4,
    GetRoots = 5,
    AdvanceSeq = 6,
    GetLastSeq = 7,
    Lock = 8,
    LockRecover = 9,
    SrchGetCompact = 10,
    SrchCommitCompact = 11,
    OpenInoMap = 12,
    GetVolopt = 13,
    SetVolopt = 14,
    ClearVolopt = 15,
    Farewell = 16,
}

impl Cmd {
    pub fn from_u8(v: u8) -> Option<Cmd> {
        Some(match v {
            1 => Cmd::Greeting,
            2 => Cmd::AllocInodes,
            3 => Cmd::GetLogTrees,
            4 => Cmd::CommitLogTrees,
            5 => Cmd::GetRoots,
            6 => Cmd::AdvanceSeq,
            7 => Cmd::GetLastSeq,
            8 => Cmd::Lock,
            9 => Cmd::LockRecover,
            10 => Cmd::SrchGetCompact,
            11 => Cmd::SrchCommitCompact,
            12 => Cmd::OpenInoMap,
            13 => Cmd::GetVolopt,
            14 => Cmd::SetVolopt,
            15 => Cmd::ClearVolopt,
            16 => Cmd::Farewell,
            _ => return None,
        })
    }
}

pub struct Request {
    pub cmd: u8,
    pub id: u64,
    pub rid: u64,
    pub payload: Vec<u8>,
}

pub struct Response {
    pub cmd: u8,
    pub id: u64,
    pub error: i32,
    pub payload: Vec<u8>,
}

pub fn read_request(r: &mut impl Read) -> io::Result<Request> {
    let mut hdr = [0u8; 19];
    r.read_exact(&mut hdr)?;
    let cmd = hdr[0];
    let id = u64::from_le_bytes(hdr[1..9].try_into().unwrap());
    let rid = u64::from_le_bytes(hdr[9..17].try_into().unwrap());
    let len = u16::from_le_bytes(hdr[17..19].try_into().unwrap()) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::other("request payload too large"));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Request { cmd, id, rid, payload })
}

pub fn write_request(w: &mut impl Write, cmd: u8, id: u64, rid: u64, payload: &[u8]) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = Vec::with_capacity(19 + payload.len());
    buf.push(cmd);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&rid.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf)
}

pub fn read_response(r: &mut impl Read) -> io::Result<Response> {
    let mut hdr = [0u8; 15];
    r.read_exact(&mut hdr)?;
    let cmd = hdr[0];
    let id = u64::from_le_bytes(hdr[1..9].try_into().unwrap());
    let error = i32::from_le_bytes(hdr[9..13].try_into().unwrap());
    let len = u16::from_le_bytes(hdr[13..15].try_into().unwrap()) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::other("response payload too large"));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Response { cmd, id, error, payload })
}

pub fn write_response(
    w: &mut impl Write,
    cmd: u8,
    id: u64,
    error: i32,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = Vec::with_capacity(15 + payload.len());
    buf.push(cmd);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&error.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf)
}

/// Where responses for a registered client go.  The server's farewell
/// worker responds long after the handling thread moved on, so sinks are
/// addressed by rid through the registry.
pub(crate) trait ResponseSink: Send + Sync {
    fn send(&self, cmd: u8, id: u64, error: i32, payload: &[u8]) -> Result<()>;
    fn shutdown(&self) {}
}

pub(crate) struct TcpSink {
    stream: Mutex<TcpStream>,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> TcpSink {
        TcpSink { stream: Mutex::new(stream) }
    }
}

impl ResponseSink for TcpSink {
    fn send(&self, cmd: u8, id: u64, error: i32, payload: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock();
        write_response(&mut *stream, cmd, id, error, payload)?;
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

/// Registered client connections by rid.
pub(crate) struct Conns {
    map: Mutex<HashMap<u64, Arc<dyn ResponseSink>>>,
}

impl Conns {
    pub fn new() -> Conns {
        Conns { map: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, rid: u64, sink: Arc<dyn ResponseSink>) {
        self.map.lock().insert(rid, sink);
    }

    pub fn remove(&self, rid: u64) {
        self.map.lock().remove(&rid);
    }

    pub fn send(&self, rid: u64, cmd: u8, id: u64, error: i32, payload: &[u8]) -> Result<()> {
        let sink = self.map.lock().get(&rid).cloned().ok_or(Error::NotFound)?;
        sink.send(cmd, id, error, payload)
    }

    pub fn shutdown_all(&self) {
        for sink in self.map.lock().values() {
            sink.shutdown();
        }
    }
}

pub(crate) fn parse_payload<T: bytemuck::Pod>(payload: &[u8]) -> Result<T> {
    if payload.len() != std::mem::size_of::<T>() {
        return Err(Error::Protocol("unexpected payload length"));
    }
    Ok(bytemuck::pod_read_unaligned(payload))
}

/// The client half of the protocol: greeting handshake on connect, then one
/// method per command.  Used by mounts talking to the elected server and by
/// the integration tests.
pub struct Client {
    stream: TcpStream,
    rid: u64,
    next_id: u64,
    pub greeting: NetGreeting,
}

impl Client {
    /// Connect and complete the greeting exchange.  `server_term` is zero
    /// for a first mount and the previously greeted term on reconnect.
    pub fn connect(
        addr: SocketAddr,
        fsid: u64,
        rid: u64,
        server_term: u64,
        flags: u64,
    ) -> Result<Client> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut client = Client {
            stream,
            rid,
            next_id: 1,
            greeting: NetGreeting::default(),
        };

        let gr = NetGreeting { fsid, format_vers: FORMAT_VERS, server_term, rid, flags };
        let payload = client.request(Cmd::Greeting, bytemuck::bytes_of(&gr))?;
        client.greeting = parse_payload(&payload)?;
        trace!(rid = %format_args!("{rid:016x}"), term = client.greeting.server_term, "greeted");
        Ok(client)
    }

    /// Convenience for tests and tools: a quorum-member mount with a random
    /// rid.
    pub fn connect_new(addr: SocketAddr, fsid: u64) -> Result<Client> {
        Client::connect(addr, fsid, rand::random::<u64>() | 1, 0, GREETING_FLAG_QUORUM)
    }

    pub fn rid(&self) -> u64 {
        self.rid
    }

    fn request(&mut self, cmd: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        let id = self.next_id;
        self.next_id += 1;
        write_request(&mut self.stream, cmd as u8, id, self.rid, payload)?;
        loop {
            let resp = read_response(&mut self.stream)?;
            if resp.id != id {
                continue;
            }
            if resp.error != 0 {
                return Err(Error::from_errno(resp.error));
            }
            return Ok(resp.payload);
        }
    }

    pub fn alloc_inodes(&mut self, count: u64) -> Result<(u64, u64)> {
        let resp = self.request(Cmd::AllocInodes, &count.to_le_bytes())?;
        let ial: NetInodeAlloc = parse_payload(&resp)?;
        Ok((ial.ino, ial.nr))
    }

    pub fn get_log_trees(&mut self) -> Result<LogTrees> {
        let resp = self.request(Cmd::GetLogTrees, &[])?;
        parse_payload(&resp)
    }

    pub fn commit_log_trees(&mut self, lt: &LogTrees) -> Result<()> {
        self.request(Cmd::CommitLogTrees, bytemuck::bytes_of(lt))?;
        Ok(())
    }

    pub fn get_roots(&mut self) -> Result<NetRoots> {
        let resp = self.request(Cmd::GetRoots, &[])?;
        parse_payload(&resp)
    }

    pub fn advance_seq(&mut self) -> Result<u64> {
        let resp = self.request(Cmd::AdvanceSeq, &[])?;
        parse_payload(&resp)
    }

    pub fn get_last_seq(&mut self) -> Result<u64> {
        let resp = self.request(Cmd::GetLastSeq, &[])?;
        parse_payload(&resp)
    }

    pub fn lock(&mut self, nl: &NetLock) -> Result<NetLock> {
        let resp = self.request(Cmd::Lock, bytemuck::bytes_of(nl))?;
        parse_payload(&resp)
    }

    pub fn srch_get_compact(&mut self) -> Result<SrchCompact> {
        let resp = self.request(Cmd::SrchGetCompact, &[])?;
        parse_payload(&resp)
    }

    pub fn srch_commit_compact(&mut self, sc: &SrchCompact) -> Result<()> {
        self.request(Cmd::SrchCommitCompact, bytemuck::bytes_of(sc))?;
        Ok(())
    }

    pub fn open_ino_map(&mut self, group_nr: u64) -> Result<OpenInoMap> {
        let args = OpenInoMapArgs { group_nr };
        let resp = self.request(Cmd::OpenInoMap, bytemuck::bytes_of(&args))?;
        parse_payload(&resp)
    }

    pub fn get_volopt(&mut self) -> Result<VolumeOptions> {
        let resp = self.request(Cmd::GetVolopt, &[])?;
        parse_payload(&resp)
    }

    pub fn set_volopt(&mut self, volopt: &VolumeOptions) -> Result<()> {
        self.request(Cmd::SetVolopt, bytemuck::bytes_of(volopt))?;
        Ok(())
    }

    pub fn clear_volopt(&mut self, volopt: &VolumeOptions) -> Result<()> {
        self.request(Cmd::ClearVolopt, bytemuck::bytes_of(volopt))?;
        Ok(())
    }

    /// Blocks until the server has reclaimed this mount's state; quorum
    /// member farewells may be held back until enough peers remain.
    pub fn farewell(&mut self) -> Result<()> {
        self.request(Cmd::Farewell, &[])?;
        Ok(())
    }
}

/// The exact request payload size per command; dispatch rejects anything
/// else before the handler runs.
pub fn expected_payload_len(cmd: Cmd) -> usize {
    use std::mem::size_of;
    match cmd {
        Cmd::Greeting => size_of::<NetGreeting>(),
        Cmd::AllocInodes => size_of::<u64>(),
        Cmd::GetLogTrees => 0,
        Cmd::CommitLogTrees => size_of::<LogTrees>(),
        Cmd::GetRoots => 0,
        Cmd::AdvanceSeq => 0,
        Cmd::GetLastSeq => 0,
        Cmd::Lock => size_of::<NetLock>(),
        Cmd::LockRecover => size_of::<crate::format::Key>(),
        Cmd::SrchGetCompact => 0,
        Cmd::SrchCommitCompact => size_of::<SrchCompact>(),
        Cmd::OpenInoMap => size_of::<OpenInoMapArgs>(),
        Cmd::GetVolopt => 0,
        Cmd::SetVolopt => size_of::<VolumeOptions>(),
        Cmd::ClearVolopt => size_of::<VolumeOptions>(),
        Cmd::Farewell => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_request(&mut buf, Cmd::AllocInodes as u8, 7, 0xabcd, &42u64.to_le_bytes()).unwrap();
        let req = read_request(&mut buf.as_slice()).unwrap();
        assert_eq!(req.cmd, Cmd::AllocInodes as u8);
        assert_eq!(req.id, 7);
        assert_eq!(req.rid, 0xabcd);
        assert_eq!(u64::from_le_bytes(req.payload.try_into().unwrap()), 42);

        let mut buf = Vec::new();
        write_response(&mut buf, Cmd::AllocInodes as u8, 7, -22, &[]).unwrap();
        let resp = read_response(&mut buf.as_slice()).unwrap();
        assert_eq!(resp.id, 7);
        assert_eq!(resp.error, -22);
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn cmd_codes_round_trip() {
        for v in 1..=16u8 {
            assert_eq!(Cmd::from_u8(v).unwrap() as u8, v);
        }
        assert!(Cmd::from_u8(0).is_none());
        assert!(Cmd::from_u8(17).is_none());
    }
}
