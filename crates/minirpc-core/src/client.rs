//! Blocking client for codec connections.
//!
//! One call is in flight per connection: `call` holds a lock across the write
//! and the matching read, and checks that the reply carries the same sequence
//! number it sent.

use crate::codec::{BinaryCodec, Codec, Header, Payload};
use crate::{Result, RpcError};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Client bound to one codec connection.
pub struct Client<C: Codec = BinaryCodec<TcpStream>> {
    codec: C,
    in_flight: Mutex<()>,
    next_seq: AtomicU64,
}

impl Client<BinaryCodec<TcpStream>> {
    /// Connect to a server over TCP.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!("RPC client connected to {}", stream.peer_addr()?);
        Ok(Self::new(BinaryCodec::new(stream)?))
    }
}

impl<C: Codec> Client<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            in_flight: Mutex::new(()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Invoke `service_method` with `args`, decoding the result into `reply`.
    ///
    /// A non-empty error in the reply header becomes `RpcError::Remote`; the
    /// connection stays usable. Transport failures close it.
    pub fn call(&self, service_method: &str, args: &dyn Payload, reply: &mut dyn Payload) -> Result<()> {
        let _guard = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        self.codec.write(&Header::new(service_method, seq), args)?;

        let mut header = Header::default();
        self.codec.read_header(&mut header)?;
        if header.seq != seq {
            let _ = self.codec.close();
            return Err(RpcError::Decode {
                message: format!("reply seq {} does not match call seq {}", header.seq, seq),
                eof: false,
            });
        }
        if header.is_error() {
            self.codec.discard_body()?;
            return Err(RpcError::Remote(header.error));
        }
        self.codec.read_body(reply)
    }

    pub fn close(&self) -> Result<()> {
        self.codec.close()
    }
}
