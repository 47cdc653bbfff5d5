//! 客户端与服务端共享的分片上传协议类型。

use serde::{Deserialize, Serialize};

pub const UPLOAD_CHUNK_PATH: &str = "/api/upload_chunk";
pub const CANCEL_UPLOAD_PATH: &str = "/api/cancel_upload";

pub const FIELD_CHUNK: &str = "chunk";
pub const FIELD_FILE_NAME: &str = "fileName";
pub const FIELD_CHUNK_INDEX: &str = "chunkIndex";
pub const FIELD_TOTAL_CHUNKS: &str = "totalChunks";
pub const FIELD_UPLOAD_ID: &str = "uploadId";
pub const FIELD_FILE_SIZE: &str = "fileSize";
pub const FIELD_DIRECTORY_ID: &str = "directoryId";

/// 服务端确认整文件合并完成时 `message` 中包含的标记。
pub const COMPLETION_MARKER: &str = "completed";

/// 单个分片请求的应答。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_complete: Option<bool>,
}

impl ChunkResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            assembly_complete: None,
        }
    }

    pub fn assembled(message: impl Into<String>) -> Self {
        Self {
            assembly_complete: Some(true),
            ..Self::accepted(message)
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: String::new(),
            error: Some(error.into()),
            assembly_complete: None,
        }
    }

    /// 判断服务端是否声明文件已合并完成。
    ///
    /// 显式的 `assemblyComplete` 字段优先；缺省时退回到旧服务端的
    /// `message` 文本匹配。
    pub fn signals_completion(&self) -> bool {
        match self.assembly_complete {
            Some(value) => value,
            None => self.message.contains(COMPLETION_MARKER),
        }
    }
}

/// 取消上传通知的请求体。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub upload_id: String,
}
