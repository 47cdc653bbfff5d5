//! 路由装配：分片接收、取消与版本接口，以及公共中间件。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::{CHUNK_FORM_OVERHEAD, MAX_CHUNK_SIZE};
use crate::http::{add_security_headers, build_cors_layer};
use crate::locking::LockManager;
use crate::protocol::{CANCEL_UPLOAD_PATH, UPLOAD_CHUNK_PATH};
use crate::storage::Storage;
use crate::upload::{self, UploadConfig};
use crate::version;

pub const SERVER_INFO_PATH: &str = "/api/version";

/// 构建完整的 HTTP 路由。
pub fn build_router(
    storage: Arc<Storage>,
    upload_config: Arc<UploadConfig>,
    locks: Arc<LockManager>,
    cors_origins: Option<&str>,
) -> Router {
    let chunk_body_limit = (MAX_CHUNK_SIZE + CHUNK_FORM_OVERHEAD) as usize;
    let mut app = Router::new()
        .route(
            UPLOAD_CHUNK_PATH,
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route(CANCEL_UPLOAD_PATH, post(upload::cancel_upload))
        .route(SERVER_INFO_PATH, get(version::get_server_info))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(upload_config))
        .layer(Extension(locks));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}
