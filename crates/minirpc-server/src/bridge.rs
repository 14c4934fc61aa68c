//! HTTP-JSON bridge into the service registry.
//!
//! Accepts `{"method": "Service.Method", "params": [<argument>]}` and answers
//! `{"result": <reply>}`. Exactly one parameter is accepted; the registry
//! methods take a single structured argument.

use crate::http::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use minirpc_core::{Registry, Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Bridge request body.
#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Bridge success body.
#[derive(Debug, Serialize)]
pub struct BridgeResponse {
    pub result: Value,
}

/// POST handler for the bridge path.
pub async fn handle_bridge(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match invoke(&state.registry, &body).await {
        Ok(result) => (StatusCode::OK, Json(BridgeResponse { result })).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: RpcError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Bridge call failed: {}", err);
    } else {
        warn!("Bridge request rejected ({}): {}", status.as_u16(), err);
    }
    (status, err.to_string()).into_response()
}

/// Take the single argument out of `params`.
fn single_param(params: Vec<Value>) -> Result<Value> {
    let count = params.len();
    let mut params = params.into_iter();
    match (params.next(), count) {
        (Some(param), 1) => Ok(param),
        _ => Err(RpcError::InvalidParams {
            message: format!("expected exactly one parameter, got {}", count),
        }),
    }
}

/// Resolve, decode, call and encode one bridge request.
pub async fn invoke(registry: &Arc<Registry>, body: &[u8]) -> Result<Value> {
    let request: BridgeRequest =
        serde_json::from_slice(body).map_err(|e| RpcError::InvalidParams {
            message: format!("Invalid request body: {}", e),
        })?;

    debug!("Bridge call: {}", request.method);

    let (_, method) = registry.lookup(&request.method)?;
    let param = single_param(request.params)?;

    let mut arg = registry.new_arg_value(&method);
    arg.from_json(param).map_err(|e| RpcError::InvalidParams {
        message: format!("Invalid parameter types: {}", e),
    })?;

    // Handlers are plain blocking functions.
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || {
        let mut reply = registry.new_reply_value(&method);
        registry.call(&method, arg.as_ref(), reply.as_mut())?;
        reply.to_json().map_err(|e| RpcError::Invocation {
            method: method.full_name().to_string(),
            message: format!("failed to encode reply: {}", e),
        })
    })
    .await
    .map_err(|e| RpcError::Invocation {
        method: request.method,
        message: format!("handler task failed: {}", e),
    })?
}
