//! Centralized configuration constants for minirpc.

/// Wire codec limits.
pub struct CodecConfig;

impl CodecConfig {
    /// Upper bound for a single encoded record (header or body).
    pub const MAX_RECORD_SIZE: u64 = 16 * 1024 * 1024; // 16MB
}

/// HTTP and TCP server parameters.
pub struct ServerConfig;

impl ServerConfig {
    /// Path of the HTTP-JSON bridge.
    pub const RPC_PATH: &'static str = "/rpc";
    /// Path of the debug introspection page.
    pub const DEBUG_PATH: &'static str = "/debug/rpc";
    pub const HEALTH_PATH: &'static str = "/health";

    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    /// Concurrent TCP codec connections accepted before new ones are refused.
    pub const MAX_CONNECTIONS: usize = 256;
    pub const MAX_HTTP_BODY_BYTES: usize = 1024 * 1024; // 1MB
}
