//! minirpc server - HTTP-JSON bridge and debug page over a minirpc registry.
//!
//! The binary hosts three listeners on one shared [`minirpc_core::Registry`]:
//! the JSON bridge (`POST /rpc`), the debug page (`GET /debug/rpc`) and the
//! binary codec endpoint served by [`minirpc_core::RpcServer`].

pub mod bridge;
pub mod debug;
pub mod demo;
pub mod http;

pub use bridge::{BridgeRequest, BridgeResponse};
pub use debug::render_debug_page;
pub use demo::{calc_service, demo_registry, Operands};
pub use http::{router, start_http_server, AppState};
