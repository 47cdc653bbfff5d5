//! CLI arguments and configuration defaults for the server and the uploader.

use clap::{Args, Parser, Subcommand};
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;
use crate::orchestrator::{
    DEFAULT_MAX_BATCH, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_TOTAL, OrchestratorConfig,
};
use crate::source::DEFAULT_CHUNK_SIZE;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
/// 分片表单中除分片本体外的字段余量。
pub const CHUNK_FORM_OVERHEAD: u64 = 64 * 1024;
pub const UPLOAD_TEMP_DIR: &str = ".drive/temp";
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 8;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;

#[derive(Parser, Debug)]
#[command(name = "chunk-drive", version = VERSION_INFO, about = "Chunked file upload server and client")]
pub struct Cli {
    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chunk receiving server.
    Serve(ServeArgs),
    /// Upload local files to a running server.
    Upload(UploadArgs),
}

/// Server options, each overridable through `CHUNK_DRIVE_*` variables.
#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(
        short = 's',
        long,
        env = "CHUNK_DRIVE_STORAGE_DIR",
        default_value = ".drive/storage",
        help = "Storage directory for assembled files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "CHUNK_DRIVE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CHUNK_DRIVE_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "CHUNK_DRIVE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CHUNK_DRIVE_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "CHUNK_DRIVE_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "CHUNK_DRIVE_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        help = "Max concurrent upload sessions (0 to disable)"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "CHUNK_DRIVE_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Upload temp cleanup threshold in seconds (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
}

/// Uploader options.
#[derive(Args, Debug)]
pub struct UploadArgs {
    #[arg(
        short = 'u',
        long,
        env = "CHUNK_DRIVE_SERVER",
        default_value = "http://127.0.0.1:5005",
        help = "Base URL of the upload server"
    )]
    pub server: String,
    #[arg(
        short = 'd',
        long,
        env = "CHUNK_DRIVE_DIRECTORY",
        help = "Target directory relative to the server storage root"
    )]
    pub directory: Option<String>,
    #[arg(
        long,
        env = "CHUNK_DRIVE_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Chunk size in bytes"
    )]
    pub chunk_size: u64,
    #[arg(
        short = 'j',
        long,
        env = "CHUNK_DRIVE_MAX_CONCURRENT",
        default_value_t = DEFAULT_MAX_CONCURRENT,
        help = "Max files uploading at the same time"
    )]
    pub max_concurrent: usize,
    #[arg(
        long,
        env = "CHUNK_DRIVE_MAX_TOTAL",
        default_value_t = DEFAULT_MAX_TOTAL,
        help = "Max uploads tracked at once (0 to disable)"
    )]
    pub max_total: usize,
    #[arg(
        long,
        env = "CHUNK_DRIVE_MAX_BATCH",
        default_value_t = DEFAULT_MAX_BATCH,
        help = "Max files accepted in one batch (0 to disable)"
    )]
    pub max_batch: usize,
    #[arg(required = true, help = "Files to upload")]
    pub files: Vec<PathBuf>,
}

impl UploadArgs {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            chunk_size: self.chunk_size,
            max_concurrent: self.max_concurrent,
            max_total: self.max_total,
            max_batch: self.max_batch,
        }
    }
}
