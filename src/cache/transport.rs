//! Cache channels
//!
//! The client talks to the store over two channels: a publish channel that
//! pushes compiled blocks, and a lookup channel going through the router
//! that indexes them. Both are traits so a store can be served in-process
//! ([`super::memory::MemoryStore`]) or over TCP ([`TcpPublish`], [`TcpLookup`]).

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use parking_lot::Mutex;
use tracing::debug;

use super::proto::{read_frame, write_frame, BlockKey, CachedBlock, Hello, Request, Response, Role, PROTOCOL_VERSION};
use crate::error::TransportError;
use crate::memory::modules::ModuleId;

/// Answer to a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupReply {
    Found { meta: Vec<u8>, code: Vec<u8> },
    NotFound,
    /// The channel never attached the key's module
    ModuleNotAttached,
}

pub trait PublishChannel: Send + Sync {
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError>;

    fn publish(&self, key: &BlockKey, meta: &[u8], code: &[u8]) -> Result<(), TransportError>;
}

pub trait LookupChannel: Send + Sync {
    /// Fails with [`TransportError::NotIndexed`] until the router knows the modules
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError>;

    fn lookup(&self, key: &BlockKey) -> Result<LookupReply, TransportError>;

    fn enumerate(&self, module: &ModuleId) -> Result<Vec<CachedBlock>, TransportError>;
}

/// One framed request/response connection. A stream left mid-frame by a
/// failed call is dropped and the next call reconnects.
struct Connection {
    addr: SocketAddr,
    role: Role,
    stream: Mutex<Option<TcpStream>>,
}

impl Connection {
    fn open<A: ToSocketAddrs>(addr: A, role: Role) -> Result<Self, TransportError> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to"))?;
        let stream = Self::handshake(addr, role)?;
        Ok(Self {
            addr,
            role,
            stream: Mutex::new(Some(stream)),
        })
    }

    fn handshake(addr: SocketAddr, role: Role) -> Result<TcpStream, TransportError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        write_frame(
            &mut stream,
            &Hello {
                version: PROTOCOL_VERSION,
                role,
            },
        )?;
        expect_ok(read_frame(&mut stream)?)?;
        debug!(?role, %addr, "cache channel open");
        Ok(stream)
    }

    fn call(&self, req: &Request) -> Result<Response, TransportError> {
        let mut guard = self.stream.lock();
        let stream = match &mut *guard {
            Some(stream) => stream,
            slot => slot.insert(Self::handshake(self.addr, self.role)?),
        };
        let res = write_frame(stream, req).and_then(|()| read_frame(stream));
        if let Err(e) = &res {
            if desyncs(e) {
                debug!(role = ?self.role, error = %e, "dropping cache channel stream");
                *guard = None;
            }
        }
        res
    }
}

/// Errors after which the stream position is unknown
fn desyncs(e: &TransportError) -> bool {
    matches!(
        e,
        TransportError::Io(_) | TransportError::Encode(_) | TransportError::FrameTooLarge(_) | TransportError::Protocol(_)
    )
}

fn expect_ok(resp: Response) -> Result<(), TransportError> {
    match resp {
        Response::Ok => Ok(()),
        Response::NotIndexed => Err(TransportError::NotIndexed),
        Response::Error(msg) => Err(TransportError::Remote(msg)),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(resp: &Response) -> TransportError {
    TransportError::Protocol(format!("unexpected response {resp:?}"))
}

pub struct TcpPublish(Connection);

impl TcpPublish {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Connection::open(addr, Role::Publish).map(Self)
    }
}

impl PublishChannel for TcpPublish {
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError> {
        expect_ok(self.0.call(&Request::Attach {
            modules: modules.to_vec(),
        })?)
    }

    fn publish(&self, key: &BlockKey, meta: &[u8], code: &[u8]) -> Result<(), TransportError> {
        let resp = self.0.call(&Request::Sync {
            key: key.clone(),
            meta: meta.to_vec(),
            code: code.to_vec(),
        })?;
        match resp {
            Response::ModuleNotAttached => Err(TransportError::NotAttached(key.module.clone())),
            other => expect_ok(other),
        }
    }
}

pub struct TcpLookup(Connection);

impl TcpLookup {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Connection::open(addr, Role::Lookup).map(Self)
    }
}

impl LookupChannel for TcpLookup {
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError> {
        expect_ok(self.0.call(&Request::Attach {
            modules: modules.to_vec(),
        })?)
    }

    fn lookup(&self, key: &BlockKey) -> Result<LookupReply, TransportError> {
        match self.0.call(&Request::Lookup { key: key.clone() })? {
            Response::Found { meta, code } => Ok(LookupReply::Found { meta, code }),
            Response::NotFound => Ok(LookupReply::NotFound),
            Response::ModuleNotAttached => Ok(LookupReply::ModuleNotAttached),
            Response::Error(msg) => Err(TransportError::Remote(msg)),
            other => Err(unexpected(&other)),
        }
    }

    fn enumerate(&self, module: &ModuleId) -> Result<Vec<CachedBlock>, TransportError> {
        match self.0.call(&Request::Enumerate { module: module.clone() })? {
            Response::Blocks(blocks) => Ok(blocks),
            Response::ModuleNotAttached => Err(TransportError::NotAttached(module.clone())),
            Response::Error(msg) => Err(TransportError::Remote(msg)),
            other => Err(unexpected(&other)),
        }
    }
}
