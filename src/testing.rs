//! 测试用的可编排分片传输。

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::task::UploadId;
use crate::transport::{ChunkAck, ChunkMeta, ChunkTransport, ProgressFn};

type AckHook = Box<dyn Fn(&ChunkMeta) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ReceivedChunk {
    pub upload_id: UploadId,
    pub file_name: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub data: Bytes,
}

#[derive(Default)]
struct Script {
    rejections: HashMap<(String, u64), String>,
    transport_failures: HashMap<(String, u64), String>,
    withhold_completion: Vec<String>,
    abort_failures: HashMap<String, TransferError>,
}

/// 记录每个到达“服务端”的分片；可选闸门让测试逐个放行请求。
pub struct ScriptedTransport {
    gate: Option<Semaphore>,
    script: Mutex<Script>,
    received: Mutex<Vec<ReceivedChunk>>,
    dispatched: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_notices: Mutex<Vec<UploadId>>,
    after_ack: Mutex<Option<AckHook>>,
    changed: Notify,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 每个分片请求都要等待 [`ScriptedTransport::release`] 放行。
    pub fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            gate,
            script: Mutex::new(Script::default()),
            received: Mutex::new(Vec::new()),
            dispatched: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_notices: Mutex::new(Vec::new()),
            after_ack: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn reject(&self, file_name: &str, chunk_index: u64, message: &str) {
        self.script
            .lock()
            .expect("script lock")
            .rejections
            .insert((file_name.to_string(), chunk_index), message.to_string());
    }

    pub fn fail_transport(&self, file_name: &str, chunk_index: u64, message: &str) {
        self.script
            .lock()
            .expect("script lock")
            .transport_failures
            .insert((file_name.to_string(), chunk_index), message.to_string());
    }

    pub fn withhold_completion(&self, file_name: &str) {
        self.script
            .lock()
            .expect("script lock")
            .withhold_completion
            .push(file_name.to_string());
    }

    /// 请求被取消时返回给定错误而不是 `Canceled`，模拟被中止的连接随后报错。
    pub fn fail_on_abort(&self, file_name: &str, error: TransferError) {
        self.script
            .lock()
            .expect("script lock")
            .abort_failures
            .insert(file_name.to_string(), error);
    }

    fn aborted(&self, file_name: &str) -> TransferError {
        self.script
            .lock()
            .expect("script lock")
            .abort_failures
            .get(file_name)
            .cloned()
            .unwrap_or(TransferError::Canceled)
    }

    /// 在分片被确认之后、应答返回之前同步调用。
    pub fn on_ack(&self, hook: impl Fn(&ChunkMeta) + Send + Sync + 'static) {
        *self.after_ack.lock().expect("hook lock") = Some(Box::new(hook));
    }

    pub fn received(&self) -> Vec<ReceivedChunk> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn received_for(&self, file_name: &str) -> Vec<ReceivedChunk> {
        self.received()
            .into_iter()
            .filter(|chunk| chunk.file_name == file_name)
            .collect()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_notices(&self) -> Vec<UploadId> {
        self.cancel_notices.lock().expect("notice lock").clone()
    }

    pub async fn wait_for_dispatched(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.dispatched() >= count {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_cancel_notice(&self, id: &UploadId) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancel_notices().contains(id) {
                return;
            }
            notified.await;
        }
    }

    async fn respond(
        &self,
        chunk: Bytes,
        meta: &ChunkMeta,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, TransferError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.aborted(&meta.file_name)),
                permit = gate.acquire() => permit.expect("gate open").forget(),
            }
        }
        if cancel.is_cancelled() {
            return Err(self.aborted(&meta.file_name));
        }

        let key = (meta.file_name.clone(), meta.chunk_index);
        let (rejection, failure, withhold) = {
            let script = self.script.lock().expect("script lock");
            (
                script.rejections.get(&key).cloned(),
                script.transport_failures.get(&key).cloned(),
                script.withhold_completion.contains(&meta.file_name),
            )
        };
        if let Some(message) = failure {
            return Err(TransferError::Transport(message));
        }
        if let Some(message) = rejection {
            return Err(TransferError::ServerRejection(message));
        }

        progress(chunk.len() as u64 / 2);
        progress(chunk.len() as u64);
        self.received
            .lock()
            .expect("received lock")
            .push(ReceivedChunk {
                upload_id: meta.upload_id.clone(),
                file_name: meta.file_name.clone(),
                chunk_index: meta.chunk_index,
                total_chunks: meta.total_chunks,
                data: chunk,
            });
        if let Some(hook) = self.after_ack.lock().expect("hook lock").as_ref() {
            hook(meta);
        }

        let completed = meta.is_last() && !withhold;
        Ok(ChunkAck {
            is_final: meta.is_last(),
            completion_signaled: completed,
            message: if completed {
                "File upload completed successfully.".into()
            } else {
                format!("Chunk {}/{} uploaded successfully.", meta.chunk_index, meta.total_chunks)
            },
        })
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn send_chunk(
        &self,
        chunk: Bytes,
        meta: &ChunkMeta,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<ChunkAck, TransferError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.changed.notify_waiters();

        let result = self.respond(chunk, meta, progress, cancel).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        result
    }

    async fn notify_cancel(&self, upload_id: &UploadId) -> Result<(), TransferError> {
        self.cancel_notices
            .lock()
            .expect("notice lock")
            .push(upload_id.clone());
        self.changed.notify_waiters();
        Ok(())
    }
}
