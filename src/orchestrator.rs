//! 上传调度器：FIFO 队列、并发槽位、跟踪上限与可观察的任务列表。
//!
//! 所有状态变更都在同一把同步锁内完成，锁从不跨越 `.await`。
//! 槽位计数与任务状态在同一临界区内一起修改，因此 `uploading`
//! 的任务数始终等于已占用的槽位数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AdmissionRejected;
use crate::registry::CancellationRegistry;
use crate::source::{DEFAULT_CHUNK_SIZE, FileRef, total_chunks};
use crate::task::{UploadEvent, UploadId, UploadStatus, UploadTask};
use crate::transfer::{FileTransfer, TransferOutcome};
use crate::transport::ChunkTransport;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MAX_TOTAL: usize = 200;
pub const DEFAULT_MAX_BATCH: usize = 10;

/// 调度器配置；`max_total` 与 `max_batch` 为 0 表示不限制。
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub chunk_size: u64,
    pub max_concurrent: usize,
    pub max_total: usize,
    pub max_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_total: DEFAULT_MAX_TOTAL,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

pub type CompletionHook = Arc<dyn Fn(&UploadTask) + Send + Sync>;

struct Entry {
    task: UploadTask,
    file: FileRef,
    remove_on_finish: bool,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    queue: VecDeque<UploadId>,
    active: usize,
}

impl State {
    fn position(&self, id: &UploadId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.task.id == id)
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.queue.is_empty()
    }
}

struct Inner {
    config: OrchestratorConfig,
    transport: Arc<dyn ChunkTransport>,
    registry: CancellationRegistry,
    state: Mutex<State>,
    /// 订阅前为 `None`，此时事件直接丢弃。
    events: Mutex<Option<mpsc::UnboundedSender<UploadEvent>>>,
    events_taken: AtomicBool,
    on_complete: Mutex<Option<CompletionHook>>,
    idle: Notify,
}

/// 分片上传调度器。克隆得到的是同一个实例的句柄。
///
/// 启动上传与取消都会 `tokio::spawn`，因此 `enqueue`、`enqueue_batch`、
/// `cancel`、`remove` 与 `cancel_all` 必须在 Tokio 运行时内调用，否则会 panic。
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(config: OrchestratorConfig, transport: Arc<dyn ChunkTransport>) -> Self {
        let mut config = config;
        if config.max_concurrent == 0 {
            warn!("max_concurrent of 0 clamped to 1");
            config.max_concurrent = 1;
        }
        if config.chunk_size == 0 {
            warn!("chunk_size of 0 clamped to 1");
            config.chunk_size = 1;
        }
        Self {
            inner: Arc::new(Inner {
                config,
                registry: CancellationRegistry::new(transport.clone()),
                transport,
                state: Mutex::new(State::default()),
                events: Mutex::new(None),
                events_taken: AtomicBool::new(false),
                on_complete: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// 订阅事件，只能订阅一次。只收到订阅之后发生的事件。
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        if self.inner.events_taken.swap(true, AtomicOrdering::SeqCst) {
            return None;
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        *self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(events);
        Some(events_rx)
    }

    /// 每个文件完成时调用一次，供调用方刷新目录与配额显示。
    pub fn set_completion_hook(&self, hook: impl Fn(&UploadTask) + Send + Sync + 'static) {
        *self
            .inner
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// 接纳一个文件；有空闲槽位时立即开始。
    pub fn enqueue(
        &self,
        file: FileRef,
        directory_id: Option<String>,
    ) -> Result<UploadTask, AdmissionRejected> {
        let mut state = self.inner.lock_state();
        let max_total = self.inner.config.max_total;
        if max_total > 0 && state.entries.len() >= max_total {
            warn!(name = file.name(), max_total, "upload rejected: too many files");
            return Err(AdmissionRejected::TooManyFiles { max: max_total });
        }
        let index = self.inner.admit(&mut state, file, directory_id);
        self.inner.schedule(&mut state);
        Ok(state.entries[index].task.clone())
    }

    /// 接纳一批文件，全部接纳或全部拒绝。
    pub fn enqueue_batch(
        &self,
        files: Vec<FileRef>,
        directory_id: Option<String>,
    ) -> Result<Vec<UploadTask>, AdmissionRejected> {
        if files.is_empty() {
            return Err(AdmissionRejected::EmptyBatch);
        }
        let config = &self.inner.config;
        if config.max_batch > 0 && files.len() > config.max_batch {
            return Err(AdmissionRejected::TooManyFilesInBatch {
                max: config.max_batch,
            });
        }

        let mut state = self.inner.lock_state();
        if config.max_total > 0 && state.entries.len() + files.len() > config.max_total {
            warn!(
                batch = files.len(),
                tracked = state.entries.len(),
                "batch rejected: too many files"
            );
            return Err(AdmissionRejected::TooManyFiles {
                max: config.max_total,
            });
        }
        let first = state.entries.len();
        for file in files {
            self.inner.admit(&mut state, file, directory_id.clone());
        }
        self.inner.schedule(&mut state);
        Ok(state.entries[first..]
            .iter()
            .map(|entry| entry.task.clone())
            .collect())
    }

    /// 取消上传。排队中的任务直接移除且不发出任何请求；
    /// 上传中的任务转为 `canceled` 并保留在列表中。
    pub fn cancel(&self, id: &UploadId) -> bool {
        let mut state = self.inner.lock_state();
        let Some(index) = state.position(id) else {
            return false;
        };
        match state.entries[index].task.status {
            UploadStatus::Queued => {
                self.inner.drop_queued(&mut state, index);
                true
            }
            UploadStatus::Uploading => self.inner.registry.cancel(id),
            _ => false,
        }
    }

    /// 从列表中移除任务；上传中的任务先取消，观察到终态后再移除。
    pub fn remove(&self, id: &UploadId) -> bool {
        let mut state = self.inner.lock_state();
        let Some(index) = state.position(id) else {
            return false;
        };
        match state.entries[index].task.status {
            UploadStatus::Queued => self.inner.drop_queued(&mut state, index),
            UploadStatus::Uploading => {
                state.entries[index].remove_on_finish = true;
                self.inner.registry.cancel(id);
            }
            _ => {
                state.entries.remove(index);
                self.inner.emit(UploadEvent::Removed { id: id.clone() });
            }
        }
        true
    }

    /// 取消所有上传中的任务，清空队列与列表。
    ///
    /// 排队与已结束的任务立即移出列表。上传中的任务仍占用槽位，
    /// 因此在转入终态之前保留在列表中，随后自动移除。
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock_state();
        state.queue.clear();
        let mut kept = Vec::new();
        for mut entry in std::mem::take(&mut state.entries) {
            if entry.task.status == UploadStatus::Uploading {
                entry.remove_on_finish = true;
                self.inner.registry.cancel(&entry.task.id);
                kept.push(entry);
            } else {
                self.inner.emit(UploadEvent::Removed {
                    id: entry.task.id.clone(),
                });
            }
        }
        info!(canceled = kept.len(), "cancel all uploads");
        state.entries = kept;
        if state.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    /// 移除所有已进入终态的任务。
    pub fn clear_finished(&self) {
        let mut state = self.inner.lock_state();
        state.entries.retain(|entry| {
            if entry.task.status.is_terminal() {
                self.inner.emit(UploadEvent::Removed {
                    id: entry.task.id.clone(),
                });
                false
            } else {
                true
            }
        });
    }

    /// 按接纳顺序返回任务快照。
    pub fn list(&self) -> Vec<UploadTask> {
        let state = self.inner.lock_state();
        state.entries.iter().map(|entry| entry.task.clone()).collect()
    }

    pub fn get(&self, id: &UploadId) -> Option<UploadTask> {
        let state = self.inner.lock_state();
        state.position(id).map(|index| state.entries[index].task.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_state().active
    }

    /// 等待直到没有排队或上传中的任务。
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_state().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: UploadEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = events.as_ref()
            && sender.send(event).is_err()
        {
            // 接收端已丢弃。
            *events = None;
        }
    }

    /// 追加一个排队任务，返回其在列表中的位置。
    fn admit(&self, state: &mut State, file: FileRef, directory_id: Option<String>) -> usize {
        let task = UploadTask {
            id: UploadId::generate(),
            file_name: file.name().to_string(),
            file_size: file.size(),
            directory_id,
            chunk_size: self.config.chunk_size,
            total_chunks: total_chunks(file.size(), self.config.chunk_size),
            status: UploadStatus::Queued,
            percent: 0,
            error: None,
        };
        debug!(upload_id = %task.id, name = task.file_name, size = task.file_size, "upload queued");
        self.emit(UploadEvent::Queued(task.clone()));
        state.queue.push_back(task.id.clone());
        state.entries.push(Entry {
            task,
            file,
            remove_on_finish: false,
        });
        state.entries.len() - 1
    }

    fn drop_queued(&self, state: &mut State, index: usize) {
        let entry = state.entries.remove(index);
        state.queue.retain(|queued| queued != &entry.task.id);
        debug!(upload_id = %entry.task.id, "queued upload removed");
        self.emit(UploadEvent::Removed { id: entry.task.id });
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// 有空闲槽位且队列非空时按 FIFO 启动任务。
    fn schedule(self: &Arc<Self>, state: &mut State) {
        while state.active < self.config.max_concurrent {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            let Some(index) = state.position(&id) else {
                continue;
            };
            let cancel = CancellationToken::new();
            if let Err(err) = self.registry.register(id.clone(), cancel.clone()) {
                error!(upload_id = %id, error = %err, "cannot start upload");
                let task = &mut state.entries[index].task;
                task.status = UploadStatus::Error;
                task.error = Some(err.to_string());
                self.emit(UploadEvent::Failed {
                    id,
                    message: err.to_string(),
                });
                continue;
            }

            let entry = &mut state.entries[index];
            entry.task.status = UploadStatus::Uploading;
            state.active += 1;
            info!(upload_id = %id, name = entry.task.file_name, "upload started");
            self.emit(UploadEvent::Started { id: id.clone() });

            let transfer = FileTransfer {
                id,
                file: entry.file.clone(),
                directory_id: entry.task.directory_id.clone(),
                chunk_size: self.config.chunk_size,
            };
            let inner = self.clone();
            tokio::spawn(async move { inner.run_transfer(transfer, cancel).await });
        }
    }

    async fn run_transfer(self: Arc<Self>, transfer: FileTransfer, cancel: CancellationToken) {
        let progress_inner = self.clone();
        let progress_id = transfer.id.clone();
        let on_progress = Arc::new(move |percent: u8| {
            progress_inner.update_progress(&progress_id, percent);
        });
        let outcome = transfer
            .run(self.transport.as_ref(), &cancel, on_progress)
            .await;
        self.finish(&transfer.id, outcome);
    }

    fn update_progress(&self, id: &UploadId, percent: u8) {
        let mut state = self.lock_state();
        let Some(index) = state.position(id) else {
            return;
        };
        let task = &mut state.entries[index].task;
        if task.status == UploadStatus::Uploading && percent > task.percent {
            task.percent = percent;
            self.emit(UploadEvent::Progress {
                id: id.clone(),
                percent,
            });
        }
    }

    /// 记录终态、释放槽位并推进队列；每个任务恰好调用一次。
    fn finish(self: &Arc<Self>, id: &UploadId, outcome: TransferOutcome) {
        let mut completed = None;
        {
            let mut state = self.lock_state();
            self.registry.release(id);
            state.active = state.active.saturating_sub(1);

            if let Some(index) = state.position(id) {
                let entry = &mut state.entries[index];
                match outcome {
                    TransferOutcome::Completed => {
                        entry.task.status = UploadStatus::Done;
                        entry.task.percent = 100;
                        info!(upload_id = %id, name = entry.task.file_name, "upload finished");
                        self.emit(UploadEvent::Completed(entry.task.clone()));
                        completed = Some(entry.task.clone());
                    }
                    TransferOutcome::Failed(err) => {
                        entry.task.status = UploadStatus::Error;
                        entry.task.error = Some(err.to_string());
                        warn!(upload_id = %id, name = entry.task.file_name, error = %err, "upload failed");
                        self.emit(UploadEvent::Failed {
                            id: id.clone(),
                            message: err.to_string(),
                        });
                    }
                    TransferOutcome::Canceled => {
                        entry.task.status = UploadStatus::Canceled;
                        info!(upload_id = %id, name = entry.task.file_name, "upload canceled");
                        self.emit(UploadEvent::Canceled { id: id.clone() });
                    }
                }
                if entry.remove_on_finish {
                    state.entries.remove(index);
                    self.emit(UploadEvent::Removed { id: id.clone() });
                }
            }

            self.schedule(&mut state);
            if state.is_idle() {
                self.idle.notify_waiters();
            }
        }

        if let Some(task) = completed {
            let hook = self
                .on_complete
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook {
                hook(&task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::testing::ScriptedTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn config(max_concurrent: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            chunk_size: 4,
            max_concurrent,
            ..OrchestratorConfig::default()
        }
    }

    fn file(name: &str, len: usize) -> FileRef {
        FileRef::from_bytes(name, vec![name.as_bytes()[0]; len])
    }

    fn statuses(orchestrator: &UploadOrchestrator) -> Vec<UploadStatus> {
        orchestrator.list().iter().map(|task| task.status).collect()
    }

    async fn settle(orchestrator: &UploadOrchestrator) {
        tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_idle())
            .await
            .expect("orchestrator idle");
    }

    #[tokio::test]
    async fn five_large_files_respect_concurrency_bound() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(
            OrchestratorConfig {
                chunk_size: 4 * MIB,
                max_concurrent: 2,
                ..OrchestratorConfig::default()
            },
            transport.clone(),
        );
        let mut events = orchestrator.take_events().expect("events");

        let names = ["a", "b", "c", "d", "e"];
        let mut ids = Vec::new();
        for name in names {
            let task = orchestrator
                .enqueue(file(name, (10 * MIB) as usize), None)
                .expect("admit");
            assert_eq!(task.total_chunks, 3);
            ids.push(task.id);
        }
        assert_eq!(
            statuses(&orchestrator),
            vec![
                UploadStatus::Uploading,
                UploadStatus::Uploading,
                UploadStatus::Queued,
                UploadStatus::Queued,
                UploadStatus::Queued,
            ]
        );

        transport.release(15);
        settle(&orchestrator).await;

        let tasks = orchestrator.list();
        assert!(tasks.iter().all(|task| task.status == UploadStatus::Done));
        assert!(tasks.iter().all(|task| task.percent == 100));
        assert!(transport.max_in_flight() <= 2);
        for name in names {
            let sizes: Vec<usize> = transport
                .received_for(name)
                .iter()
                .map(|chunk| chunk.data.len())
                .collect();
            assert_eq!(sizes, vec![(4 * MIB) as usize, (4 * MIB) as usize, (2 * MIB) as usize]);
        }

        let mut uploading = 0usize;
        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                UploadEvent::Started { id } => {
                    uploading += 1;
                    assert!(uploading <= 2, "more than two uploads in flight");
                    started.push(id);
                }
                UploadEvent::Completed(_)
                | UploadEvent::Failed { .. }
                | UploadEvent::Canceled { .. } => uploading -= 1,
                UploadEvent::Progress { percent, .. } => assert!(percent < 100),
                _ => {}
            }
        }
        assert_eq!(started, ids);
    }

    #[tokio::test]
    async fn admission_beyond_max_total_is_rejected() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(
            OrchestratorConfig {
                max_total: 2,
                ..config(1)
            },
            transport.clone(),
        );
        orchestrator.enqueue(file("a", 4), None).expect("admit a");
        orchestrator.enqueue(file("b", 4), None).expect("admit b");

        let before: Vec<UploadId> = orchestrator.list().into_iter().map(|t| t.id).collect();
        let result = orchestrator.enqueue(file("c", 4), None);
        assert_eq!(result.err(), Some(AdmissionRejected::TooManyFiles { max: 2 }));
        let after: Vec<UploadId> = orchestrator.list().into_iter().map(|t| t.id).collect();
        assert_eq!(before, after);

        transport.release(2);
        settle(&orchestrator).await;
        // 终态任务仍在列表中，仍计入上限。
        assert!(orchestrator.enqueue(file("c", 4), None).is_err());
        orchestrator.clear_finished();
        assert!(orchestrator.enqueue(file("c", 4), None).is_ok());
    }

    #[tokio::test]
    async fn batch_admission_is_all_or_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = UploadOrchestrator::new(
            OrchestratorConfig {
                max_batch: 2,
                max_total: 3,
                ..config(1)
            },
            transport,
        );

        let result = orchestrator.enqueue_batch(vec![file("a", 1), file("b", 1), file("c", 1)], None);
        assert_eq!(
            result.err(),
            Some(AdmissionRejected::TooManyFilesInBatch { max: 2 })
        );
        assert_eq!(
            orchestrator.enqueue_batch(Vec::new(), None).err(),
            Some(AdmissionRejected::EmptyBatch)
        );

        orchestrator
            .enqueue_batch(vec![file("a", 1), file("b", 1)], Some("docs".into()))
            .expect("admit batch");
        let result = orchestrator.enqueue_batch(vec![file("c", 1), file("d", 1)], None);
        assert_eq!(result.err(), Some(AdmissionRejected::TooManyFiles { max: 3 }));
        assert_eq!(orchestrator.list().len(), 2);

        settle(&orchestrator).await;
        assert!(
            orchestrator
                .list()
                .iter()
                .all(|task| task.directory_id.as_deref() == Some("docs"))
        );
    }

    #[tokio::test]
    async fn canceling_queued_upload_issues_no_request() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        orchestrator.enqueue(file("a", 4), None).expect("admit a");
        let queued = orchestrator.enqueue(file("b", 4), None).expect("admit b");
        assert_eq!(queued.status, UploadStatus::Queued);

        assert!(orchestrator.cancel(&queued.id));
        assert!(orchestrator.get(&queued.id).is_none());

        transport.release(1);
        settle(&orchestrator).await;
        assert!(transport.received_for("b").is_empty());
        assert_eq!(transport.dispatched(), 1);
        assert!(transport.cancel_notices().is_empty());
    }

    #[tokio::test]
    async fn canceling_in_flight_upload_ends_canceled_not_failed() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        let task = orchestrator.enqueue(file("a", 10), None).expect("admit");
        transport.wait_for_dispatched(1).await;

        assert!(orchestrator.cancel(&task.id));
        assert!(!orchestrator.cancel(&task.id));
        settle(&orchestrator).await;

        let task = orchestrator.get(&task.id).expect("still listed");
        assert_eq!(task.status, UploadStatus::Canceled);
        assert!(task.error.is_none());
        assert!(!orchestrator.cancel(&task.id));

        tokio::time::timeout(Duration::from_secs(1), transport.wait_for_cancel_notice(&task.id))
            .await
            .expect("cancel notice");
        assert_eq!(transport.cancel_notices(), vec![task.id.clone()]);
        assert_eq!(transport.dispatched(), 1);
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_between_chunks_stops_before_next_dispatch() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        let task = orchestrator.enqueue(file("a", 10), None).expect("admit");

        let handle = orchestrator.clone();
        let id = task.id.clone();
        transport.on_ack(move |meta| {
            if meta.chunk_index == 0 {
                handle.cancel(&id);
            }
        });
        transport.release(3);
        settle(&orchestrator).await;

        assert_eq!(
            orchestrator.get(&task.id).map(|t| t.status),
            Some(UploadStatus::Canceled)
        );
        let indices: Vec<u64> = transport
            .received_for("a")
            .iter()
            .map(|chunk| chunk.chunk_index)
            .collect();
        assert_eq!(indices, vec![0]);
        assert_eq!(transport.dispatched(), 1);
        tokio::time::timeout(Duration::from_secs(1), transport.wait_for_cancel_notice(&task.id))
            .await
            .expect("cancel notice");
    }

    #[tokio::test]
    async fn server_rejection_fails_file_and_frees_slot() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reject("a", 0, "duplicate filename");
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        let mut events = orchestrator.take_events().expect("events");

        let failed = orchestrator.enqueue(file("a", 10), None).expect("admit a");
        let next = orchestrator.enqueue(file("b", 10), None).expect("admit b");
        settle(&orchestrator).await;

        let failed = orchestrator.get(&failed.id).expect("listed");
        assert_eq!(failed.status, UploadStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("duplicate filename"));
        assert!(failed.percent < 100);
        assert_eq!(
            orchestrator.get(&next.id).map(|t| t.status),
            Some(UploadStatus::Done)
        );
        assert!(transport.received_for("a").is_empty());

        let mut failures = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::Failed { id, message } = event {
                failures.push((id, message));
            }
        }
        assert_eq!(failures, vec![(failed.id, "duplicate filename".to_string())]);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_as_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_transport("a", 1, "timed out");
        let orchestrator = UploadOrchestrator::new(config(2), transport.clone());
        let task = orchestrator.enqueue(file("a", 10), None).expect("admit");
        settle(&orchestrator).await;

        let task = orchestrator.get(&task.id).expect("listed");
        assert_eq!(task.status, UploadStatus::Error);
        assert_eq!(
            task.error,
            Some(TransferError::Transport("timed out".into()).to_string())
        );
        assert_eq!(transport.dispatched(), 2);
    }

    #[tokio::test]
    async fn remove_uploading_cancels_then_drops_from_list() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        let task = orchestrator.enqueue(file("a", 10), None).expect("admit");
        transport.wait_for_dispatched(1).await;

        assert!(orchestrator.remove(&task.id));
        settle(&orchestrator).await;
        assert!(orchestrator.list().is_empty());
        tokio::time::timeout(Duration::from_secs(1), transport.wait_for_cancel_notice(&task.id))
            .await
            .expect("cancel notice");
        assert!(!orchestrator.remove(&task.id));
    }

    #[tokio::test]
    async fn cancel_all_clears_queue_without_starting() {
        let transport = Arc::new(ScriptedTransport::gated());
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        for name in ["a", "b", "c"] {
            orchestrator.enqueue(file(name, 10), None).expect("admit");
        }
        transport.wait_for_dispatched(1).await;

        orchestrator.cancel_all();
        assert_eq!(statuses(&orchestrator), vec![UploadStatus::Uploading]);
        settle(&orchestrator).await;
        assert!(orchestrator.list().is_empty());
        assert_eq!(transport.dispatched(), 1);
        assert!(transport.received().is_empty());
    }

    #[tokio::test]
    async fn completion_hook_runs_once_per_completed_file() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reject("c", 0, "quota exceeded");
        let orchestrator = UploadOrchestrator::new(config(2), transport);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        orchestrator.set_completion_hook(move |task| {
            assert_eq!(task.status, UploadStatus::Done);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        orchestrator
            .enqueue_batch(vec![file("a", 9), file("b", 0), file("c", 5)], None)
            .expect("admit");
        settle(&orchestrator).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn events_are_dropped_until_someone_subscribes() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = UploadOrchestrator::new(config(2), transport);
        for _ in 0..5 {
            orchestrator
                .enqueue_batch(vec![file("a", 40), file("b", 40), file("c", 40)], None)
                .expect("admit");
            settle(&orchestrator).await;
            orchestrator.clear_finished();
        }

        let mut events = orchestrator.take_events().expect("events");
        assert!(events.try_recv().is_err(), "events buffered without subscriber");
        assert!(orchestrator.take_events().is_none());

        let task = orchestrator.enqueue(file("z", 4), None).expect("admit");
        settle(&orchestrator).await;
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(received.first(), Some(UploadEvent::Queued(queued)) if queued.id == task.id));
        assert!(matches!(received.last(), Some(UploadEvent::Completed(done)) if done.id == task.id));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_stall_uploads() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = UploadOrchestrator::new(config(1), transport);
        drop(orchestrator.take_events());

        orchestrator
            .enqueue_batch(vec![file("a", 10), file("b", 10)], None)
            .expect("admit");
        settle(&orchestrator).await;
        assert_eq!(
            statuses(&orchestrator),
            vec![UploadStatus::Done, UploadStatus::Done]
        );
    }

    #[tokio::test]
    async fn transport_error_after_abort_still_ends_canceled() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.fail_on_abort("a", TransferError::Transport("connection reset".into()));
        let orchestrator = UploadOrchestrator::new(config(1), transport.clone());
        let task = orchestrator.enqueue(file("a", 10), None).expect("admit");
        transport.wait_for_dispatched(1).await;

        assert!(orchestrator.cancel(&task.id));
        settle(&orchestrator).await;
        let task = orchestrator.get(&task.id).expect("listed");
        assert_eq!(task.status, UploadStatus::Canceled);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = UploadOrchestrator::new(config(0), transport);
        assert_eq!(orchestrator.config().max_concurrent, 1);
        orchestrator.enqueue(file("a", 3), None).expect("admit");
        settle(&orchestrator).await;
        assert_eq!(statuses(&orchestrator), vec![UploadStatus::Done]);
    }
}
