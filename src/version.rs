//! 版本与上传能力信息。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::config::MAX_CHUNK_SIZE;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    max_chunk_size: u64,
}

/// 返回当前版本与单个分片允许的最大字节数。
pub async fn get_server_info() -> JsonResponse<ServerInfo> {
    JsonResponse(ServerInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        max_chunk_size: MAX_CHUNK_SIZE,
    })
}
