//! 分片接收处理器：按序落盘分片、合并成品文件、取消会话与临时目录管理。

use axum::extract::multipart::MultipartError;
use axum::extract::{Extension, Json, Multipart};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::config::{DEFAULT_LOCK_WAIT_TIMEOUT_SECS, MAX_CHUNK_SIZE, UPLOAD_TEMP_DIR};
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::protocol::{
    CancelRequest, ChunkResponse, FIELD_CHUNK, FIELD_CHUNK_INDEX, FIELD_DIRECTORY_ID,
    FIELD_FILE_NAME, FIELD_FILE_SIZE, FIELD_TOTAL_CHUNKS, FIELD_UPLOAD_ID,
};
use crate::storage::Storage;

const TRACKING_FILE: &str = "tracking.json";
const MAX_UPLOAD_ID_LEN: usize = 128;
const DUPLICATE_NAME: &str = "A file with this name already exists in this directory.";

#[derive(Debug)]
pub struct UploadConfig {
    pub max_total_size: u64,
    pub max_chunks: u64,
    pub max_concurrent: u64,
    pub temp_ttl: Duration,
}

/// 上传会话的进度记录，保存在临时目录的 `tracking.json` 中。
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UploadTracking {
    file_name: String,
    file_size: u64,
    total_chunks: u64,
    directory_id: Option<String>,
    uploaded_chunks: Vec<u64>,
    last_updated: String,
}

impl UploadTracking {
    fn next_chunk(&self) -> u64 {
        self.uploaded_chunks
            .iter()
            .max()
            .map_or(0, |last| last + 1)
    }
}

/// 一个已解析的分片请求。
#[derive(Debug)]
pub(crate) struct ChunkForm {
    pub(crate) upload_id: String,
    pub(crate) file_name: String,
    pub(crate) chunk_index: u64,
    pub(crate) total_chunks: u64,
    pub(crate) file_size: u64,
    pub(crate) directory_id: Option<String>,
    pub(crate) chunk: Bytes,
}

/// 接收单个分片。
pub async fn upload_chunk(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(locks): Extension<Arc<LockManager>>,
    multipart: Multipart,
) -> Result<JsonResponse<ChunkResponse>, ApiError> {
    let form = read_chunk_form(multipart).await?;
    store_chunk(&storage, &upload, &locks, form)
        .await
        .map(JsonResponse)
}

/// 取消上传会话并删除临时分片。
pub async fn cancel_upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Json(payload): Json<CancelRequest>,
) -> Result<JsonResponse<ChunkResponse>, ApiError> {
    discard_upload(&storage, &locks, &payload.upload_id)
        .await
        .map(JsonResponse)
}

async fn read_chunk_form(mut multipart: Multipart) -> Result<ChunkForm, ApiError> {
    let mut fields = HashMap::new();
    let mut chunk = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FIELD_CHUNK {
            chunk = Some(field.bytes().await.map_err(multipart_error)?);
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            fields.insert(name, value);
        }
    }

    let missing = || ApiError::BadRequest("Missing required upload parameters.".into());
    let text = |key: &str| {
        fields
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let number = |key: &str| -> Result<u64, ApiError> {
        text(key)
            .ok_or_else(missing)?
            .parse::<u64>()
            .map_err(|_| ApiError::BadRequest("Invalid parameter value.".into()))
    };

    Ok(ChunkForm {
        upload_id: text(FIELD_UPLOAD_ID).ok_or_else(missing)?,
        file_name: text(FIELD_FILE_NAME).ok_or_else(missing)?,
        chunk_index: number(FIELD_CHUNK_INDEX)?,
        total_chunks: number(FIELD_TOTAL_CHUNKS)?,
        file_size: number(FIELD_FILE_SIZE)?,
        directory_id: text(FIELD_DIRECTORY_ID),
        chunk: chunk.ok_or_else(missing)?,
    })
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Chunk too large.".into())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// 校验并保存一个分片；最后一个分片到达时合并成品文件。
pub(crate) async fn store_chunk(
    storage: &Storage,
    upload: &UploadConfig,
    locks: &LockManager,
    form: ChunkForm,
) -> Result<ChunkResponse, ApiError> {
    validate_upload_id(&form.upload_id)?;
    let file_name = sanitize_file_name(&form.file_name)?;
    if form.total_chunks == 0 || form.chunk_index >= form.total_chunks {
        return Err(ApiError::BadRequest("Chunk index out of range.".into()));
    }
    if upload.max_total_size > 0 && form.file_size > upload.max_total_size {
        return Err(ApiError::PayloadTooLarge(
            "Upload size exceeds limit.".into(),
        ));
    }
    if upload.max_chunks > 0 && form.total_chunks > upload.max_chunks {
        return Err(ApiError::BadRequest(
            "Upload chunk count exceeds limit.".into(),
        ));
    }
    if form.chunk.len() as u64 > MAX_CHUNK_SIZE {
        return Err(ApiError::PayloadTooLarge("Chunk too large.".into()));
    }
    let directory = storage
        .resolve_directory(form.directory_id.as_deref())
        .await
        .map_err(|_| ApiError::BadRequest("Invalid directory ID.".into()))?;
    let target = directory.join(&file_name);

    let _session = locks
        .lock_with_timeout(&session_lock_key(&form.upload_id), lock_timeout())
        .await
        .map_err(|_| ApiError::Conflict("Upload session is busy.".into()))?;
    let temp_dir = upload_temp_root(storage).join(&form.upload_id);
    let tracking_path = temp_dir.join(TRACKING_FILE);

    let mut tracking = match read_tracking(&tracking_path).await? {
        Some(_) if form.chunk_index == 0 => {
            debug!(upload_id = form.upload_id, "chunk 0 repeated");
            return Ok(ChunkResponse::accepted("Chunk 0 was already processed."));
        }
        Some(tracking) => {
            if tracking.total_chunks != form.total_chunks
                || tracking.file_size != form.file_size
                || tracking.file_name != file_name
            {
                return Err(ApiError::BadRequest(
                    "Upload parameters changed during transfer.".into(),
                ));
            }
            let expected = tracking.next_chunk();
            if form.chunk_index != expected {
                warn!(
                    upload_id = form.upload_id,
                    expected,
                    got = form.chunk_index,
                    "out-of-order chunk"
                );
                return Err(ApiError::BadRequest(format!(
                    "Out-of-order chunk. Expected {expected}, got {}.",
                    form.chunk_index
                )));
            }
            tracking
        }
        None if form.chunk_index == 0 => {
            if path_exists(&target).await? {
                return Err(ApiError::Conflict(DUPLICATE_NAME.into()));
            }
            if upload.max_concurrent > 0
                && count_upload_temp_dirs(storage).await? >= upload.max_concurrent
            {
                return Err(ApiError::TooManyRequests(60));
            }
            fs::create_dir_all(&temp_dir)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            info!(
                upload_id = form.upload_id,
                name = file_name,
                file_size = form.file_size,
                total_chunks = form.total_chunks,
                "upload session started"
            );
            UploadTracking {
                file_name: file_name.clone(),
                file_size: form.file_size,
                total_chunks: form.total_chunks,
                directory_id: form.directory_id.clone(),
                uploaded_chunks: Vec::new(),
                last_updated: String::new(),
            }
        }
        None => {
            return Err(ApiError::BadRequest(
                "Out-of-order chunk. Missing tracking record (chunk 0 not processed).".into(),
            ));
        }
    };

    let chunk_path = temp_dir.join(part_file_name(form.chunk_index));
    fs::write(&chunk_path, &form.chunk)
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to save chunk. {err}")))?;
    tracking.uploaded_chunks.push(form.chunk_index);
    tracking.last_updated = chrono::Utc::now().to_rfc3339();
    write_tracking(&tracking_path, &tracking).await?;
    debug!(
        upload_id = form.upload_id,
        chunk_index = form.chunk_index,
        bytes = form.chunk.len(),
        "chunk saved"
    );

    if form.chunk_index + 1 < form.total_chunks {
        return Ok(ChunkResponse::accepted(format!(
            "Chunk {}/{} uploaded successfully.",
            form.chunk_index, form.total_chunks
        )));
    }

    let _target_guard = locks
        .lock_with_timeout(&target.to_string_lossy(), lock_timeout())
        .await
        .map_err(|_| ApiError::Conflict("Target path is busy.".into()))?;
    let assembled = assemble(&temp_dir, &target, &tracking).await;
    if !matches!(assembled, Err(ApiError::Internal(_))) {
        if let Err(err) = fs::remove_dir_all(&temp_dir).await {
            warn!(upload_id = form.upload_id, error = %err, "failed to remove upload temp dir");
        }
    }
    assembled?;

    info!(
        upload_id = form.upload_id,
        name = file_name,
        file_size = form.file_size,
        "upload assembled"
    );
    Ok(ChunkResponse::assembled("File upload completed successfully."))
}

async fn assemble(
    temp_dir: &Path,
    target: &Path,
    tracking: &UploadTracking,
) -> Result<(), ApiError> {
    let missing: Vec<u64> = (0..tracking.total_chunks)
        .filter(|index| !tracking.uploaded_chunks.contains(index))
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!("Missing chunks: {missing:?}")));
    }

    let mut atomic = AtomicFile::new(target)
        .await
        .map_err(|err| ApiError::Internal(format!("Failed to assemble file: {err}")))?;
    for index in 0..tracking.total_chunks {
        if let Err(err) = atomic.append_part(&temp_dir.join(part_file_name(index))).await {
            atomic.cleanup().await;
            return Err(ApiError::Internal(format!("Failed to assemble file: {err}")));
        }
    }

    if atomic.written() != tracking.file_size {
        warn!(
            expected = tracking.file_size,
            actual = atomic.written(),
            "size mismatch after assembly"
        );
        atomic.cleanup().await;
        return Err(ApiError::BadRequest("Size mismatch after assembly.".into()));
    }

    match atomic.persist_new().await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(ApiError::Conflict(DUPLICATE_NAME.into()))
        }
        Err(err) => Err(ApiError::Internal(format!("Failed to assemble file: {err}"))),
    }
}

/// 删除上传会话的临时目录。
pub(crate) async fn discard_upload(
    storage: &Storage,
    locks: &LockManager,
    upload_id: &str,
) -> Result<ChunkResponse, ApiError> {
    let upload_id = upload_id.trim();
    if upload_id.is_empty() {
        return Err(ApiError::BadRequest("Missing upload_id.".into()));
    }
    validate_upload_id(upload_id)?;

    let _session = locks
        .lock_with_timeout(&session_lock_key(upload_id), lock_timeout())
        .await
        .map_err(|_| ApiError::Conflict("Upload session is busy.".into()))?;
    let temp_dir = upload_temp_root(storage).join(upload_id);
    if !path_exists(&temp_dir).await? {
        warn!(upload_id, "cancel for unknown upload session");
        return Err(ApiError::NotFound("Upload session not found.".into()));
    }
    fs::remove_dir_all(&temp_dir).await.map_err(|err| {
        warn!(upload_id, error = %err, "failed to remove upload temp dir");
        ApiError::Internal("Failed to remove temporary files.".into())
    })?;

    info!(upload_id, "upload canceled");
    Ok(ChunkResponse::accepted(
        "Upload cancelled and temporary files removed.",
    ))
}

fn validate_upload_id(upload_id: &str) -> Result<(), ApiError> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest("Invalid upload ID.".into()))
    }
}

/// 文件名只允许单个路径段。
fn sanitize_file_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ApiError::BadRequest("Invalid file name.".into()));
    }
    Ok(name.to_string())
}

fn session_lock_key(upload_id: &str) -> String {
    format!("upload:{upload_id}")
}

fn part_file_name(index: u64) -> String {
    format!("{index}.part")
}

fn lock_timeout() -> Duration {
    Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS)
}

async fn path_exists(path: &Path) -> Result<bool, ApiError> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

async fn read_tracking(path: &Path) -> Result<Option<UploadTracking>, ApiError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn write_tracking(path: &Path, tracking: &UploadTracking) -> Result<(), ApiError> {
    let content =
        serde_json::to_vec(tracking).map_err(|err| ApiError::Internal(err.to_string()))?;
    fs::write(path, content)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))
}

/// 返回上传临时目录的根路径。
pub fn upload_temp_root(storage: &Storage) -> PathBuf {
    let temp_path = Path::new(UPLOAD_TEMP_DIR);
    if temp_path.is_absolute() {
        return temp_path.to_path_buf();
    }

    let Some(parent) = storage.root_path().parent() else {
        return PathBuf::from(UPLOAD_TEMP_DIR);
    };

    // 存储目录本身位于 `.drive/` 下时，临时目录与其并列。
    if temp_path.iter().next() == Some(OsStr::new(".drive"))
        && parent.file_name() == Some(OsStr::new(".drive"))
    {
        let rest: PathBuf = temp_path.iter().skip(1).collect();
        return if rest.as_os_str().is_empty() {
            parent.to_path_buf()
        } else {
            parent.join(rest)
        };
    }

    parent.join(temp_path)
}

/// 统计当前活跃的上传临时目录数量。
pub async fn count_upload_temp_dirs(storage: &Storage) -> Result<u64, ApiError> {
    let temp_root = upload_temp_root(storage);
    if fs::metadata(&temp_root).await.is_err() {
        return Ok(0);
    }
    let mut dir = fs::read_dir(&temp_root)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let mut count = 0;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        if metadata.is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// 清理过期的上传临时目录。
pub async fn cleanup_upload_temp(
    storage: &Storage,
    upload: &UploadConfig,
) -> Result<(), std::io::Error> {
    if upload.temp_ttl.is_zero() {
        return Ok(());
    }

    let temp_root = upload_temp_root(storage);
    if fs::metadata(&temp_root).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = fs::read_dir(&temp_root).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= upload.temp_ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_dir_all(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale upload temp dir");
            } else {
                info!(path = ?path, "removed stale upload temp dir");
            }
        }
    }

    Ok(())
}
