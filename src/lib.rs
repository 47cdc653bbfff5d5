//! Chunked file upload: a client-side upload orchestrator and the server
//! endpoints that receive, order, and assemble the chunks.

pub mod atomic;
pub mod background;
pub mod config;
pub mod error;
pub mod http;
pub mod locking;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod source;
pub mod storage;
pub mod task;
pub mod transfer;
pub mod transport;
pub mod upload;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

shadow_rs::shadow!(build);

pub use error::{AdmissionRejected, ApiError, TransferError};
pub use orchestrator::{OrchestratorConfig, UploadOrchestrator};
pub use source::FileRef;
pub use task::{UploadEvent, UploadId, UploadStatus, UploadTask};
pub use transport::{ChunkTransport, HttpTransport};
