//! 单文件传输任务：按序逐个发送分片，汇总进度，识别完成与取消。

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::source::{FileRef, total_chunks};
use crate::task::{UploadId, overall_percent};
use crate::transport::{ChunkMeta, ChunkTransport, ProgressFn};

/// 文件传输的终态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed(TransferError),
    Canceled,
}

/// 一个已获得并发槽位的文件传输。
pub struct FileTransfer {
    pub id: UploadId,
    pub file: FileRef,
    pub directory_id: Option<String>,
    pub chunk_size: u64,
}

impl FileTransfer {
    pub fn total_chunks(&self) -> u64 {
        total_chunks(self.file.size(), self.chunk_size)
    }

    /// 驱动全部分片直到进入终态。分片 `k + 1` 只在分片 `k` 的应答处理完后发送。
    pub async fn run(
        &self,
        transport: &dyn ChunkTransport,
        cancel: &CancellationToken,
        on_progress: Arc<dyn Fn(u8) + Send + Sync>,
    ) -> TransferOutcome {
        let total = self.total_chunks();
        for chunk_index in 0..total {
            if cancel.is_cancelled() {
                debug!(upload_id = %self.id, chunk_index, "canceled before dispatch");
                return TransferOutcome::Canceled;
            }

            let chunk = match self.file.read_chunk(chunk_index, self.chunk_size).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(upload_id = %self.id, chunk_index, error = %err, "read chunk failed");
                    return TransferOutcome::Failed(TransferError::Source(err.to_string()));
                }
            };
            let meta = ChunkMeta {
                upload_id: self.id.clone(),
                file_name: self.file.name().to_string(),
                chunk_index,
                total_chunks: total,
                file_size: self.file.size(),
                directory_id: self.directory_id.clone(),
            };
            let chunk_len = chunk.len() as u64;
            let report = on_progress.clone();
            let progress: ProgressFn = Arc::new(move |sent| {
                report(overall_percent(chunk_index, sent, chunk_len, total));
            });

            let ack = match transport.send_chunk(chunk, &meta, progress, cancel).await {
                Ok(ack) => ack,
                Err(TransferError::Canceled) => return TransferOutcome::Canceled,
                Err(_) if cancel.is_cancelled() => return TransferOutcome::Canceled,
                Err(err) => {
                    warn!(upload_id = %self.id, chunk_index, error = %err, "chunk failed");
                    return TransferOutcome::Failed(err);
                }
            };
            debug!(upload_id = %self.id, chunk_index, total, reply = %ack.message, "chunk acknowledged");

            if meta.is_last() {
                if ack.is_final && ack.completion_signaled {
                    info!(upload_id = %self.id, name = self.file.name(), "upload complete");
                    return TransferOutcome::Completed;
                }
                warn!(upload_id = %self.id, reply = %ack.message, "final chunk not confirmed");
                return TransferOutcome::Failed(TransferError::IncompleteAssembly);
            }
        }
        TransferOutcome::Failed(TransferError::IncompleteAssembly)
    }
}
