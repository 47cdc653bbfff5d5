//! 分片传输：发送单个分片、上报字节进度、区分取消与失败。

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;
use crate::protocol::{
    CANCEL_UPLOAD_PATH, CancelRequest, ChunkResponse, FIELD_CHUNK, FIELD_CHUNK_INDEX,
    FIELD_DIRECTORY_ID, FIELD_FILE_NAME, FIELD_FILE_SIZE, FIELD_TOTAL_CHUNKS, FIELD_UPLOAD_ID,
    UPLOAD_CHUNK_PATH,
};
use crate::task::UploadId;

/// 进度上报的粒度。
const PROGRESS_SLICE: usize = 64 * 1024;

/// 接收本分片已发送的累计字节数。
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 单个分片的元数据。
#[derive(Clone, Debug)]
pub struct ChunkMeta {
    pub upload_id: UploadId,
    pub file_name: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub file_size: u64,
    pub directory_id: Option<String>,
}

impl ChunkMeta {
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }
}

/// 服务端接受分片后的确认。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkAck {
    pub is_final: bool,
    pub completion_signaled: bool,
    pub message: String,
}

/// 分片发送通道。实现方只报告服务端对本分片的答复，不判断整个文件是否完成。
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 发送一个分片。取消必须返回 [`TransferError::Canceled`]，不得表现为失败。
    async fn send_chunk(
        &self,
        chunk: Bytes,
        meta: &ChunkMeta,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, TransferError>;

    /// 通知服务端回收被放弃上传的临时数据。
    async fn notify_cancel(&self, upload_id: &UploadId) -> Result<(), TransferError>;
}

/// 基于 reqwest multipart 的 HTTP 分片传输。
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_chunk(
        &self,
        chunk: Bytes,
        meta: &ChunkMeta,
        progress: ProgressFn,
    ) -> Result<ChunkAck, TransferError> {
        let chunk_len = chunk.len() as u64;
        let body = reqwest::Body::wrap_stream(progress_stream(chunk, progress));
        let part = Part::stream_with_length(body, chunk_len)
            .file_name(meta.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text(FIELD_FILE_NAME, meta.file_name.clone())
            .text(FIELD_CHUNK_INDEX, meta.chunk_index.to_string())
            .text(FIELD_TOTAL_CHUNKS, meta.total_chunks.to_string())
            .text(FIELD_UPLOAD_ID, meta.upload_id.to_string())
            .text(FIELD_FILE_SIZE, meta.file_size.to_string())
            .text(
                FIELD_DIRECTORY_ID,
                meta.directory_id.clone().unwrap_or_default(),
            )
            .part(FIELD_CHUNK, part);

        let response = self
            .client
            .post(self.url(UPLOAD_CHUNK_PATH))
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(
            upload_id = %meta.upload_id,
            chunk_index = meta.chunk_index,
            status = status.as_u16(),
            "chunk response"
        );

        match serde_json::from_slice::<ChunkResponse>(&bytes) {
            Ok(body) if !body.success => Err(TransferError::ServerRejection(
                body.error
                    .unwrap_or_else(|| format!("server rejected chunk (HTTP {status})")),
            )),
            Ok(body) if status.is_success() => Ok(ChunkAck {
                is_final: meta.is_last(),
                completion_signaled: body.signals_completion(),
                message: body.message,
            }),
            _ => Err(TransferError::Transport(format!(
                "unexpected response (HTTP {status})"
            ))),
        }
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send_chunk(
        &self,
        chunk: Bytes,
        meta: &ChunkMeta,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, TransferError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Canceled),
            result = self.post_chunk(chunk, meta, progress) => result,
        };
        match result {
            Err(TransferError::Transport(_)) if cancel.is_cancelled() => {
                Err(TransferError::Canceled)
            }
            other => other,
        }
    }

    async fn notify_cancel(&self, upload_id: &UploadId) -> Result<(), TransferError> {
        let response = self
            .client
            .post(self.url(CANCEL_UPLOAD_PATH))
            .json(&CancelRequest {
                upload_id: upload_id.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.json::<ChunkResponse>().await.ok();
        Err(TransferError::ServerRejection(
            body.and_then(|body| body.error)
                .unwrap_or_else(|| format!("cancel rejected (HTTP {status})")),
        ))
    }
}

/// 把分片切成小段流式发送，每交出一段就上报累计字节数。
fn progress_stream(
    chunk: Bytes,
    progress: ProgressFn,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let mut pieces = Vec::with_capacity(chunk.len().div_ceil(PROGRESS_SLICE));
    let mut offset = 0;
    while offset < chunk.len() {
        let end = (offset + PROGRESS_SLICE).min(chunk.len());
        pieces.push(chunk.slice(offset..end));
        offset = end;
    }
    let mut sent = 0u64;
    stream::iter(pieces).map(move |piece| {
        sent += piece.len() as u64;
        progress(sent);
        Ok(piece)
    })
}
