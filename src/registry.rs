//! 取消登记表：上传标识到活动取消句柄的映射。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::task::UploadId;
use crate::transport::ChunkTransport;

pub struct CancellationRegistry {
    handles: Mutex<HashMap<UploadId, CancellationToken>>,
    transport: Arc<dyn ChunkTransport>,
}

impl CancellationRegistry {
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            transport,
        }
    }

    pub fn register(&self, id: UploadId, handle: CancellationToken) -> Result<(), RegistryError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        handles.insert(id, handle);
        Ok(())
    }

    /// 中止进行中的请求，并在后台尽力通知服务端。未知或已结束的标识返回 false。
    ///
    /// 通知经由 `tokio::spawn` 发出，须在 Tokio 运行时内调用。
    pub fn cancel(&self, id: &UploadId) -> bool {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel();

        let transport = self.transport.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match transport.notify_cancel(&id).await {
                Ok(()) => info!(upload_id = %id, "server notified of canceled upload"),
                Err(err) => warn!(upload_id = %id, error = %err, "cancel notification failed"),
            }
        });
        true
    }

    pub fn release(&self, id: &UploadId) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn is_registered(&self, id: &UploadId) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}
