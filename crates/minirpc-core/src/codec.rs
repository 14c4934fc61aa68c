//! Wire codec: framing and (de)serialization of Header/Body pairs.
//!
//! Every call on the wire is a header record immediately followed by exactly
//! one body record. Records are bincode-encoded back to back with no outer
//! length prefix:
//!
//! ```text
//! [Header { service_method, seq, error }][Body { shape, bytes }] ...
//! ```
//!
//! A body carries the structural shape of the type it was encoded from (see
//! [`crate::shape`]), so a reader that asks for a differently shaped type gets
//! a `TypeMismatch` instead of garbage. Types declared separately on both ends
//! interoperate as long as their serde shapes agree.

use crate::config::CodecConfig;
use crate::shape::shape_of;
use crate::{Result, RpcError};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::debug;

/// Per-call metadata sent ahead of every body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Dotted `Service.Method` name.
    pub service_method: String,
    /// Sequence number chosen by the caller, echoed in the reply.
    pub seq: u64,
    /// Empty on success, set by the far side on failure.
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// A value that can travel as a call argument or reply.
///
/// Implemented for every serde type, so registries and codecs can move
/// values around as `Box<dyn Payload>` without knowing their concrete type.
pub trait Payload: Any + Send + Sync {
    /// Structural signature of the concrete type, written next to the encoded bytes.
    fn shape(&self) -> &'static str;
    fn to_wire(&self) -> bincode::Result<Vec<u8>>;
    /// Replace `self` with the value decoded from `bytes`.
    fn from_wire(&mut self, bytes: &[u8]) -> bincode::Result<()>;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
    /// Replace `self` with the value decoded from `value`.
    fn from_json(&mut self, value: serde_json::Value) -> serde_json::Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Payload for T
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn shape(&self) -> &'static str {
        shape_of::<T>()
    }

    fn to_wire(&self) -> bincode::Result<Vec<u8>> {
        wire_options().serialize(self)
    }

    fn from_wire(&mut self, bytes: &[u8]) -> bincode::Result<()> {
        *self = wire_options().deserialize(bytes)?;
        Ok(())
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn from_json(&mut self, value: serde_json::Value) -> serde_json::Result<()> {
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Body record as written.
#[derive(Serialize)]
struct BodyRecordRef<'a> {
    shape: &'a str,
    bytes: &'a [u8],
}

/// Body record as read back.
#[derive(Deserialize)]
struct BodyRecord {
    shape: String,
    bytes: Vec<u8>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(CodecConfig::MAX_RECORD_SIZE)
}

/// Counts the bytes a decode pulled from the stream, so an EOF before the
/// first byte of a record can be told apart from a record cut short.
struct CountingReader<R> {
    inner: R,
    count: usize,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n;
        Ok(n)
    }
}

/// Encodes and decodes calls on one connection.
///
/// Not multiplexed: one `write` and one `read_header`/`read_body` pair may be
/// in flight at a time. `close` may race with either.
pub trait Codec: Send + Sync {
    /// Decode the next header into `header`.
    fn read_header(&self, header: &mut Header) -> Result<()>;

    /// Decode the body that follows the last header into `body`.
    fn read_body(&self, body: &mut dyn Payload) -> Result<()>;

    /// Consume the body that follows the last header without decoding it.
    fn discard_body(&self) -> Result<()>;

    /// Frame and flush `header` followed by `body` as one unit.
    fn write(&self, header: &Header, body: &dyn Payload) -> Result<()>;

    /// Flush and release the stream. Idempotent.
    fn close(&self) -> Result<()>;
}

/// A byte stream a [`BinaryCodec`] can split into halves and shut down.
pub trait CodecStream: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone(&self) -> std::io::Result<Self>;

    /// Shut down both directions, waking any thread blocked on the stream.
    fn shutdown(&self) -> std::io::Result<()>;
}

impl CodecStream for TcpStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl CodecStream for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// bincode implementation of [`Codec`].
pub struct BinaryCodec<S: CodecStream> {
    control: S,
    reader: Mutex<BufReader<S>>,
    writer: Mutex<BufWriter<S>>,
    closed: AtomicBool,
}

impl<S: CodecStream> BinaryCodec<S> {
    pub fn new(stream: S) -> Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            control: stream,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(BufWriter::new(writer)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RpcError::Closed)
        } else {
            Ok(())
        }
    }

    fn lock_reader(&self) -> MutexGuard<'_, BufReader<S>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, BufWriter<S>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear the connection down after a fatal error.
    ///
    /// An operation that failed because another thread closed the codec
    /// reports `Closed` rather than the incidental IO error.
    fn fail(&self, err: RpcError) -> RpcError {
        if self.is_closed() {
            return RpcError::Closed;
        }
        debug!("Codec failed, closing: {}", err);
        let _ = self.close();
        err
    }

    fn read_body_record(&self) -> Result<BodyRecord> {
        self.ensure_open()?;
        let mut reader = self.lock_reader();
        // A header always announces a body, so any EOF here is a truncation.
        wire_options()
            .deserialize_from(&mut *reader)
            .map_err(|e| self.fail(RpcError::decode(&e, false)))
    }
}

fn write_pair<W: Write>(writer: &mut W, header: &Header, body: &BodyRecordRef<'_>) -> bincode::Result<()> {
    wire_options().serialize_into(&mut *writer, header)?;
    wire_options().serialize_into(&mut *writer, body)?;
    writer.flush()?;
    Ok(())
}

impl<S: CodecStream> Codec for BinaryCodec<S> {
    fn read_header(&self, header: &mut Header) -> Result<()> {
        self.ensure_open()?;
        let mut reader = self.lock_reader();
        let mut counted = CountingReader {
            inner: &mut *reader,
            count: 0,
        };
        match wire_options().deserialize_from::<_, Header>(&mut counted) {
            Ok(decoded) => {
                *header = decoded;
                Ok(())
            }
            Err(e) => {
                let at_boundary = counted.count == 0;
                Err(self.fail(RpcError::decode(&e, at_boundary)))
            }
        }
    }

    fn read_body(&self, body: &mut dyn Payload) -> Result<()> {
        let record = self.read_body_record()?;
        let expected = body.shape();
        if record.shape != expected {
            return Err(self.fail(RpcError::TypeMismatch {
                expected: expected.to_string(),
                actual: record.shape,
            }));
        }
        body.from_wire(&record.bytes).map_err(|e| {
            self.fail(RpcError::TypeMismatch {
                expected: expected.to_string(),
                actual: format!("undecodable {}: {}", record.shape, e),
            })
        })
    }

    fn discard_body(&self) -> Result<()> {
        self.read_body_record().map(|_| ())
    }

    fn write(&self, header: &Header, body: &dyn Payload) -> Result<()> {
        self.ensure_open()?;
        let bytes = match body.to_wire() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(self.fail(RpcError::Write {
                    message: format!("failed to encode {}: {}", body.shape(), e),
                }))
            }
        };
        let record = BodyRecordRef {
            shape: body.shape(),
            bytes: &bytes,
        };

        let mut writer = self.lock_writer();
        self.ensure_open()?;
        if let Err(e) = write_pair(&mut *writer, header, &record) {
            // Still holding the writer: close must not flush the partial frame.
            return Err(self.fail(RpcError::Write {
                message: e.to_string(),
            }));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = match self.writer.try_lock() {
            Ok(mut writer) => writer.flush(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().flush(),
            // A write is in flight; shutting down below unblocks it.
            Err(TryLockError::WouldBlock) => Ok(()),
        };
        let shutdown = self.control.shutdown();

        flushed?;
        match shutdown {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    /// Connected loopback pair: (client, server).
    pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn codec_pair() -> (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>) {
        let (client, server) = tcp_pair();
        (
            BinaryCodec::new(client).unwrap(),
            BinaryCodec::new(server).unwrap(),
        )
    }

    #[test]
    fn test_header_and_body_roundtrip() {
        let (tx, rx) = codec_pair();
        let header = Header::new("Calc.Add", 7);
        let args = Args { a: 2, b: 3 };
        tx.write(&header, &args).unwrap();

        let mut read_header = Header::default();
        rx.read_header(&mut read_header).unwrap();
        let mut read_args = Args::default();
        rx.read_body(&mut read_args).unwrap();

        assert_eq!(read_header, header);
        assert_eq!(read_args, args);
    }

    #[test]
    fn test_error_header_and_unit_body() {
        let (tx, rx) = codec_pair();
        let mut header = Header::new("Calc.Div", 1);
        header.error = "divide by zero".into();
        tx.write(&header, &()).unwrap();

        let mut read_header = Header::default();
        rx.read_header(&mut read_header).unwrap();
        rx.read_body(&mut ()).unwrap();
        assert!(read_header.is_error());
        assert_eq!(read_header.error, "divide by zero");
    }

    #[test]
    fn test_back_to_back_pairs_keep_boundaries() {
        let (tx, rx) = codec_pair();
        for seq in 0..10u64 {
            tx.write(&Header::new("Echo.Say", seq), &format!("msg-{}", seq))
                .unwrap();
        }

        for seq in 0..10u64 {
            let mut header = Header::default();
            rx.read_header(&mut header).unwrap();
            let mut body = String::new();
            rx.read_body(&mut body).unwrap();
            assert_eq!(header.seq, seq);
            assert_eq!(body, format!("msg-{}", seq));
        }
    }

    #[test]
    fn test_boxed_payload_roundtrip() {
        let (tx, rx) = codec_pair();
        let outgoing: Box<dyn Payload> = Box::new(Args { a: 1, b: 2 });
        tx.write(&Header::new("Calc.Add", 1), outgoing.as_ref()).unwrap();

        let mut header = Header::default();
        rx.read_header(&mut header).unwrap();
        let mut incoming: Box<dyn Payload> = Box::new(Args::default());
        rx.read_body(incoming.as_mut()).unwrap();

        let args = incoming.as_any().downcast_ref::<Args>().unwrap();
        assert_eq!(args, &Args { a: 1, b: 2 });
    }

    #[test]
    fn test_type_mismatch_closes_codec() {
        let (tx, rx) = codec_pair();
        tx.write(&Header::new("Calc.Add", 1), &"not args".to_string())
            .unwrap();

        let mut header = Header::default();
        rx.read_header(&mut header).unwrap();
        let mut args = Args::default();
        let err = rx.read_body(&mut args).unwrap_err();
        assert!(matches!(err, RpcError::TypeMismatch { .. }));

        assert!(rx.is_closed());
        assert!(matches!(
            rx.read_header(&mut header),
            Err(RpcError::Closed)
        ));
    }

    #[test]
    fn test_discard_body_keeps_stream_in_sync() {
        let (tx, rx) = codec_pair();
        tx.write(&Header::new("Nope.Missing", 1), &Args { a: 1, b: 1 })
            .unwrap();
        tx.write(&Header::new("Echo.Say", 2), &"hi".to_string())
            .unwrap();

        let mut header = Header::default();
        rx.read_header(&mut header).unwrap();
        rx.discard_body().unwrap();

        rx.read_header(&mut header).unwrap();
        let mut body = String::new();
        rx.read_body(&mut body).unwrap();
        assert_eq!(header.seq, 2);
        assert_eq!(body, "hi");
    }

    #[test]
    fn test_peer_close_is_eof_decode_error() {
        let (tx, rx) = codec_pair();
        tx.close().unwrap();

        let mut header = Header::default();
        let err = rx.read_header(&mut header).unwrap_err();
        assert!(err.is_eof());
        assert!(rx.is_closed());
    }

    #[test]
    fn test_truncated_header_is_not_clean_eof() {
        let (mut raw, server) = tcp_pair();
        let rx = BinaryCodec::new(server).unwrap();
        // Announces an 8-byte method name, then hangs up after three bytes.
        raw.write_all(&[8, b'C', b'a', b'l']).unwrap();
        raw.flush().unwrap();
        drop(raw);

        let mut header = Header::default();
        let err = rx.read_header(&mut header).unwrap_err();
        assert!(matches!(err, RpcError::Decode { eof: false, .. }), "{}", err);
        assert!(!err.is_eof());
        assert!(rx.is_closed());
    }

    #[test]
    fn test_missing_body_is_not_clean_eof() {
        let (raw, server) = tcp_pair();
        let rx = BinaryCodec::new(server).unwrap();
        let mut raw = BufWriter::new(raw);
        wire_options()
            .serialize_into(&mut raw, &Header::new("Calc.Add", 1))
            .unwrap();
        drop(raw);

        let mut header = Header::default();
        rx.read_header(&mut header).unwrap();
        let err = rx.read_body(&mut Args::default()).unwrap_err();
        assert!(matches!(err, RpcError::Decode { eof: false, .. }), "{}", err);
    }

    #[test]
    fn test_corrupt_stream_is_decode_error() {
        let (mut raw, server) = tcp_pair();
        let rx = BinaryCodec::new(server).unwrap();
        // A varint length far beyond the record limit.
        raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F])
            .unwrap();
        raw.flush().unwrap();

        let mut header = Header::default();
        let err = rx.read_header(&mut header).unwrap_err();
        assert!(matches!(err, RpcError::Decode { eof: false, .. }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, _rx) = codec_pair();
        tx.close().unwrap();
        tx.close().unwrap();

        let mut header = Header::default();
        assert!(matches!(tx.read_header(&mut header), Err(RpcError::Closed)));
        assert!(matches!(tx.read_body(&mut ()), Err(RpcError::Closed)));
        assert!(matches!(tx.discard_body(), Err(RpcError::Closed)));
        assert!(matches!(
            tx.write(&Header::new("Calc.Add", 1), &()),
            Err(RpcError::Closed)
        ));
    }

    #[test]
    fn test_concurrent_writes_never_interleave() {
        let (tx, rx) = codec_pair();
        let tx = Arc::new(tx);
        let writers = 8u64;
        let per_writer = 50u64;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..per_writer {
                        let seq = w * per_writer + i;
                        let body = format!("{}-{}", seq, "x".repeat((seq % 17) as usize * 100));
                        tx.write(&Header::new("Echo.Say", seq), &body).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..writers * per_writer {
            let mut header = Header::default();
            rx.read_header(&mut header).unwrap();
            let mut body = String::new();
            rx.read_body(&mut body).unwrap();
            let prefix = format!("{}-", header.seq);
            assert!(body.starts_with(&prefix), "body {} for seq {}", body, header.seq);
            assert!(seen.insert(header.seq));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.len() as u64, writers * per_writer);
    }

    #[test]
    fn test_close_during_blocked_write() {
        // Nobody reads from the peer, so writes eventually block on a full socket.
        let (tx, _peer) = codec_pair();
        let tx = Arc::new(tx);
        let writer = {
            let tx = tx.clone();
            thread::spawn(move || {
                let body = vec![7u8; 64 * 1024];
                let mut seq = 0u64;
                loop {
                    if let Err(e) = tx.write(&Header::new("Blob.Put", seq), &body) {
                        return e;
                    }
                    seq += 1;
                }
            })
        };

        thread::sleep(std::time::Duration::from_millis(100));
        tx.close().unwrap();
        let err = writer.join().unwrap();
        assert!(matches!(err, RpcError::Closed), "unexpected error: {}", err);
        tx.close().unwrap();
    }

    #[test]
    fn test_shapes_follow_structure() {
        assert_ne!(Args::default().shape(), 0i64.shape());
        assert_eq!(Args::default().shape(), "{a:i64,b:i64}");
        assert_eq!(String::new().shape(), "string");
    }

    mod peer {
        /// Declared apart from `Args`, same fields.
        #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
        pub struct Operands {
            pub a: i64,
            pub b: i64,
        }
    }

    #[test]
    fn test_separately_declared_types_interoperate() {
        let (tx, rx) = codec_pair();
        tx.write(&Header::new("Calc.Add", 1), &peer::Operands { a: 4, b: 5 })
            .unwrap();

        let mut header = Header::default();
        rx.read_header(&mut header).unwrap();
        let mut args = Args::default();
        rx.read_body(&mut args).unwrap();
        assert_eq!(args, Args { a: 4, b: 5 });
        assert!(!rx.is_closed());
    }
}
