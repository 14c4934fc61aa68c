//! minirpc core - wire codec, service registry and connection server.
//!
//! This crate carries everything that does not depend on HTTP:
//! - [`codec`]: Header/Body framing over a byte stream (bincode)
//! - [`shape`]: structural signatures that let both ends check body types
//! - [`registry`]: services built at runtime and dispatched by dotted name
//! - [`server`] / [`client`]: one call in flight per TCP connection
//!
//! The HTTP-JSON bridge and the debug page live in `minirpc-server`.
//!
//! # Example
//!
//! ```rust,ignore
//! use minirpc_core::{Registry, Service};
//!
//! let registry = Registry::new();
//! registry.register(
//!     Service::builder("Calc")
//!         .method("Add", |args: &AddArgs, reply: &mut i64| {
//!             *reply = args.a + args.b;
//!             Ok::<_, String>(())
//!         })
//!         .build()?,
//! )?;
//!
//! let (_, add) = registry.lookup("Calc.Add")?;
//! assert_eq!(add.num_calls(), 0);
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod shape;

pub use client::Client;
pub use codec::{BinaryCodec, Codec, CodecStream, Header, Payload};
pub use config::{CodecConfig, ServerConfig};
pub use error::{Result, RpcError};
pub use registry::{MethodDescriptor, MethodSnapshot, Registry, Service, ServiceBuilder, ServiceSnapshot};
pub use server::{serve_codec, RpcServer, RpcServerHandle};
pub use shape::shape_of;
