//! 上传源文件句柄：名称、大小与按分片读取。

use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 默认分片大小：4 MiB。
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Clone, Debug)]
enum Source {
    Path(PathBuf),
    Memory(Bytes),
}

/// 不可变的源文件引用。
#[derive(Clone, Debug)]
pub struct FileRef {
    name: String,
    size: u64,
    source: Source,
}

impl FileRef {
    /// 打开磁盘文件，记录其当前大小。
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        Ok(Self {
            name,
            size: metadata.len(),
            source: Source::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: Source::Memory(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 读取 `[index * chunk_size, min(size, (index + 1) * chunk_size))`。
    pub async fn read_chunk(&self, index: u64, chunk_size: u64) -> io::Result<Bytes> {
        let start = index.saturating_mul(chunk_size).min(self.size);
        let end = start.saturating_add(chunk_size).min(self.size);
        match &self.source {
            Source::Memory(data) => Ok(data.slice(start as usize..end as usize)),
            Source::Path(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// 计算分片数量；空文件按一个空分片发送。
pub fn total_chunks(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size.max(1)).max(1)
}
