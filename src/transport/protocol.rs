//! RPC Wire Protocol
//!
//! Every call is an HTTP/2 `POST /rpc/<service>/<method>` whose request and
//! response bodies are bincode-encoded serde values. A failing handler
//! answers with a non-2xx status and a plain-text reason.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;

/// Root under which every service is mounted.
pub const RPC_PREFIX: &str = "/rpc";

pub const CONTENT_TYPE: &str = "application/x-bincode";

/// Path of one method, relative to the server root.
pub fn rpc_path(service: &str, method: &str) -> String {
    format!("{}/{}/{}", RPC_PREFIX, service, method)
}

/// Mount point of one service.
pub fn service_path(service: &str) -> String {
    format!("{}/{}", RPC_PREFIX, service)
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Bincode body extractor and response for RPC handlers.
///
/// ```ignore
/// async fn report(
///     manager: Extension<Arc<HeartbeatManager>>,
///     Rpc(request): Rpc<HeartbeatRequest>,
/// ) -> Rpc<HeartbeatResponse> { ... }
/// ```
#[derive(Debug, Clone)]
pub struct Rpc<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Rpc<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| (e.status(), e.body_text()))?;

        decode(&bytes)
            .map(Rpc)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
    }
}

impl<T: Serialize> IntoResponse for Rpc<T> {
    fn into_response(self) -> Response {
        match encode(&self.0) {
            Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
            Err(e) => {
                tracing::error!("Failed to encode rpc response: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}
