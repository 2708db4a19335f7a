//! Reference TCP cache server
//!
//! Serves a [`MemoryStore`] with one thread per connection. The role in the
//! opening hello decides whether the connection acts as a publisher or as a
//! router client.

use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::memory::MemoryStore;
use super::proto::{read_frame, write_frame, Hello, Request, Response, Role, PROTOCOL_VERSION};
use super::transport::{LookupChannel, LookupReply, PublishChannel};
use crate::error::TransportError;

pub struct CacheServer {
    store: Arc<MemoryStore>,
    listener: TcpListener,
}

impl CacheServer {
    pub fn bind(addr: &str, store: Arc<MemoryStore>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { store, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Accept connections until the listener fails
    pub fn serve(&self) -> io::Result<()> {
        info!(addr = ?self.listener.local_addr()?, "cache server listening");
        for stream in self.listener.incoming() {
            let stream = stream?;
            let store = Arc::clone(&self.store);
            thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                match handle(stream, &store) {
                    Ok(()) => debug!(?peer, "connection closed"),
                    Err(e) => warn!(?peer, error = %e, "connection dropped"),
                }
            });
        }
        Ok(())
    }

    /// Serve on a background thread
    pub fn spawn(self) -> thread::JoinHandle<io::Result<()>> {
        thread::spawn(move || self.serve())
    }
}

fn handle(stream: TcpStream, store: &Arc<MemoryStore>) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let hello: Hello = read_frame(&mut reader)?;
    if hello.version != PROTOCOL_VERSION {
        write_frame(&mut writer, &Response::Error(format!("unsupported version {}", hello.version)))?;
        return Err(TransportError::Protocol(format!("client version {}", hello.version)));
    }
    write_frame(&mut writer, &Response::Ok)?;
    debug!(role = ?hello.role, "client attached");

    let publisher = store.publisher();
    let router = store.router();
    loop {
        let req: Request = match read_frame(&mut reader) {
            Ok(req) => req,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let resp = match hello.role {
            Role::Publish => serve_publish(&publisher, req),
            Role::Lookup => serve_lookup(&router, req),
        };
        write_frame(&mut writer, &resp)?;
    }
}

fn error_response(e: TransportError) -> Response {
    match e {
        TransportError::NotIndexed => Response::NotIndexed,
        TransportError::NotAttached(_) => Response::ModuleNotAttached,
        other => Response::Error(other.to_string()),
    }
}

fn serve_publish(publisher: &dyn PublishChannel, req: Request) -> Response {
    let res = match req {
        Request::Attach { modules } => publisher.attach(&modules),
        Request::Sync { key, meta, code } => publisher.publish(&key, &meta, &code),
        other => return Response::Error(format!("{other:?} on a publish channel")),
    };
    res.map_or_else(error_response, |()| Response::Ok)
}

fn serve_lookup(router: &dyn LookupChannel, req: Request) -> Response {
    match req {
        Request::Attach { modules } => router.attach(&modules).map_or_else(error_response, |()| Response::Ok),
        Request::Lookup { key } => match router.lookup(&key) {
            Ok(LookupReply::Found { meta, code }) => Response::Found { meta, code },
            Ok(LookupReply::NotFound) => Response::NotFound,
            Ok(LookupReply::ModuleNotAttached) => Response::ModuleNotAttached,
            Err(e) => error_response(e),
        },
        Request::Enumerate { module } => router.enumerate(&module).map_or_else(error_response, Response::Blocks),
        Request::Sync { .. } => Response::Error("sync on a lookup channel".into()),
    }
}
