//! 文件流传输
//!
//! `TransferFileResp` 之后在同一套接字上流式收发原始文件字节。
//! 进度以 `Transferring` 状态上报，按 150ms 间隔合并（外加一次 100% 的
//! 完成态），避免每个字节都惊扰观察者。速率为字节/秒，在 1 秒采样窗口
//! 上做指数加权平滑（alpha = 0.3），首个窗口直接取原始采样值。

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::error::ConnError;
use crate::conn::protocol::TransferFileReq;
use crate::conn::state::{ConnectionState, StateCell, TransferProgress};

/// 流式读写的块大小
pub const CHUNK_SIZE: usize = 64 * 1024;

const SAMPLE_WINDOW: Duration = Duration::from_secs(1);
const EMIT_INTERVAL: Duration = Duration::from_millis(150);
const EWMA_ALPHA: f64 = 0.3;

/// 速率计：1 秒窗口采样 + 指数加权平滑
pub(crate) struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    rate: Option<f64>,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate: None,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= SAMPLE_WINDOW {
            let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.rate = Some(match self.rate {
                None => sample,
                Some(prev) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev,
            });
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    fn current(&self) -> u64 {
        match self.rate {
            Some(rate) => rate as u64,
            None => {
                // 首个窗口未满，给出瞬时估计
                let elapsed = self.window_start.elapsed();
                if elapsed >= Duration::from_millis(10) {
                    (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64
                } else {
                    0
                }
            }
        }
    }
}

/// 进度跟踪，按时间间隔合并上报
pub(crate) struct ProgressTracker {
    total: u64,
    transferred: u64,
    meter: SpeedMeter,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            transferred: 0,
            meter: SpeedMeter::new(),
            last_emit: None,
        }
    }

    /// 记录新传输的字节；到达上报间隔时返回一个进度快照
    pub(crate) fn record(&mut self, bytes: u64) -> Option<TransferProgress> {
        self.transferred += bytes;
        self.meter.record(bytes);

        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= EMIT_INTERVAL,
        };
        if due {
            self.last_emit = Some(Instant::now());
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// 完成态快照，progress 固定为 100
    pub(crate) fn finish(&self) -> TransferProgress {
        TransferProgress {
            progress: 100,
            speed: self.meter.current(),
            total_size: self.total,
            transferred_size: self.transferred,
        }
    }

    fn snapshot(&self) -> TransferProgress {
        let progress = if self.total == 0 {
            100
        } else {
            ((self.transferred * 100) / self.total) as u32
        };
        TransferProgress {
            progress,
            speed: self.meter.current(),
            total_size: self.total,
            transferred_size: self.transferred,
        }
    }
}

/// 把文件内容流式写到套接字上
///
/// 中途 I/O 失败返回 `TransferError`，不重试部分写入。
pub(crate) async fn send_file<W>(
    path: &Path,
    total_size: u64,
    writer: &mut W,
    state: &StateCell,
) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path)
        .await
        .map_err(|e| ConnError::Transfer(format!("open {}: {e}", path.display())))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut tracker = ProgressTracker::new(total_size);
    let mut remaining = total_size;

    while remaining > 0 {
        let want = CHUNK_SIZE.min(remaining as usize);
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
        if n == 0 {
            return Err(ConnError::Transfer(
                "file truncated while streaming".to_string(),
            ));
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
        remaining -= n as u64;

        if let Some(progress) = tracker.record(n as u64) {
            state.publish(ConnectionState::Transferring(progress));
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    state.publish(ConnectionState::Transferring(tracker.finish()));

    info!("Sent {total_size} bytes from {}", path.display());
    Ok(())
}

/// 从套接字读出 `meta.total_size` 个原始字节写入下载目录
pub(crate) async fn receive_file<R>(
    reader: &mut R,
    meta: &TransferFileReq,
    download_dir: &Path,
    state: &StateCell,
) -> Result<PathBuf, ConnError>
where
    R: AsyncRead + Unpin,
{
    tokio::fs::create_dir_all(download_dir)
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;

    // 去掉对端可能携带的路径分量，只保留文件名
    let safe_name = meta
        .file_name
        .split('/')
        .next_back()
        .filter(|n| !n.is_empty())
        .unwrap_or("received.bin");
    let path = download_dir.join(safe_name);

    debug!(
        "Receiving task {} ({} bytes) into {}",
        meta.task_id,
        meta.total_size,
        path.display()
    );

    let mut file = File::create(&path)
        .await
        .map_err(|e| ConnError::Transfer(format!("create {}: {e}", path.display())))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut tracker = ProgressTracker::new(meta.total_size);
    let mut remaining = meta.total_size;

    while remaining > 0 {
        let want = CHUNK_SIZE.min(remaining as usize);
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
        if n == 0 {
            return Err(ConnError::Transfer(
                "connection closed mid-stream".to_string(),
            ));
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| ConnError::Transfer(e.to_string()))?;
        remaining -= n as u64;

        if let Some(progress) = tracker.record(n as u64) {
            state.publish(ConnectionState::Transferring(progress));
        }
    }

    file.flush()
        .await
        .map_err(|e| ConnError::Transfer(e.to_string()))?;
    state.publish(ConnectionState::Transferring(tracker.finish()));

    info!("Received {} bytes into {}", meta.total_size, path.display());
    Ok(path)
}
