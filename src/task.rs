//! 上传任务记录、状态与事件。

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// 会话内唯一的上传标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Done,
    Error,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Done | UploadStatus::Error | UploadStatus::Canceled
        )
    }
}

/// 单个文件上传生命周期的快照，供界面渲染。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub directory_id: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub status: UploadStatus,
    pub percent: u8,
    pub error: Option<String>,
}

/// 调度器向界面推送的事件，每个终态恰好对应一种。
#[derive(Clone, Debug)]
pub enum UploadEvent {
    Queued(UploadTask),
    Started { id: UploadId },
    Progress { id: UploadId, percent: u8 },
    Completed(UploadTask),
    Failed { id: UploadId, message: String },
    Canceled { id: UploadId },
    Removed { id: UploadId },
}

/// 按 `round((chunk_index + fraction) / total_chunks * 100)` 计算总进度。
///
/// 未收到服务端合并确认前最多返回 99。
pub fn overall_percent(chunk_index: u64, bytes_sent: u64, chunk_len: u64, total_chunks: u64) -> u8 {
    let fraction = if chunk_len == 0 {
        1.0
    } else {
        (bytes_sent.min(chunk_len) as f64) / (chunk_len as f64)
    };
    let total = total_chunks.max(1) as f64;
    let percent = (((chunk_index as f64) + fraction) / total * 100.0).round();
    percent.clamp(0.0, 99.0) as u8
}
