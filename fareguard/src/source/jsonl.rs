// fareguard/src/source/jsonl.rs
//
// JSONL file source. Partition 0, offset = zero-based line number.
//
//   tail    — follows the file as it grows (polls every 50ms at EOF). A line
//             is only delivered once its trailing newline has been written.
//             The acked offset is kept in `{path}.offset` so a restart
//             resumes after the last committed batch.
//   replay  — reads the file once from the start; exhausted at EOF. No
//             checkpoint.
//
// Blank lines consume an offset but produce no delivery.
//
// Source id is `jsonl:{canonical path}`. A file rotated in place keeps its
// path and therefore its id; run it under a fresh --source-id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Delivery, EventSource};
use crate::error::SourceError;

const POLL: Duration = Duration::from_millis(50);
const PARTITION: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonlMode {
    Tail,
    Replay,
}

pub struct JsonlSource {
    path:       PathBuf,
    id:         String,
    mode:       JsonlMode,
    reader:     BufReader<File>,
    /// Offset the next complete line will get.
    next:       i64,
    /// Last acked offset; -1 before the first ack.
    acked:      i64,
    partial:    String,
    eof:        bool,
    checkpoint: Option<PathBuf>,
}

impl JsonlSource {
    /// Follow `path`, resuming after the checkpointed offset. Without a
    /// checkpoint, `from_end` skips what is already in the file.
    pub async fn tail(path: impl Into<PathBuf>, from_end: bool) -> Result<Self, SourceError> {
        let path       = path.into();
        let checkpoint = checkpoint_path(&path);
        let acked = match tokio::fs::read_to_string(&checkpoint).await {
            Ok(raw) => raw.trim().parse::<i64>().map_err(|e| {
                SourceError::Transport(format!("corrupt checkpoint {}: {}", checkpoint.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => -1,
            Err(e) => return Err(e.into()),
        };

        let mut src = Self::open(path, JsonlMode::Tail, acked, Some(checkpoint)).await?;
        if acked < 0 && from_end {
            let skipped = src.skip_to(i64::MAX).await?;
            src.acked = skipped - 1;
        }
        info!("Tailing {} from offset {}", src.path.display(), src.next);
        Ok(src)
    }

    pub async fn replay(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let src = Self::open(path.into(), JsonlMode::Replay, -1, None).await?;
        info!("Replaying {}", src.path.display());
        Ok(src)
    }

    async fn open(path: PathBuf, mode: JsonlMode, acked: i64, checkpoint: Option<PathBuf>) -> Result<Self, SourceError> {
        let file = File::open(&path).await?;
        let id   = format!("jsonl:{}", tokio::fs::canonicalize(&path).await?.display());
        let mut src = Self {
            path,
            id,
            mode,
            reader: BufReader::new(file),
            next: 0,
            acked,
            partial: String::new(),
            eof: false,
            checkpoint,
        };
        src.skip_to(acked + 1).await?;
        Ok(src)
    }

    pub fn acked(&self) -> i64 {
        self.acked
    }

    /// Consume complete lines until `next == target` or EOF. Returns `next`.
    async fn skip_to(&mut self, target: i64) -> Result<i64, SourceError> {
        while self.next < target {
            if self.read_line().await?.is_none() {
                break;
            }
        }
        Ok(self.next)
    }

    /// Next complete line and its offset. None at EOF; in tail mode a line
    /// without its newline yet is held back in `partial`.
    async fn read_line(&mut self) -> Result<Option<(i64, String)>, SourceError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        self.partial.push_str(&buf);
        if !self.partial.ends_with('\n') && self.mode == JsonlMode::Tail {
            return Ok(None);
        }
        let line   = std::mem::take(&mut self.partial);
        let offset = self.next;
        self.next += 1;
        Ok(Some((offset, line)))
    }

    async fn write_checkpoint(&self) -> Result<(), SourceError> {
        if let Some(path) = &self.checkpoint {
            let tmp = path.with_extension("offset.tmp");
            tokio::fs::write(&tmp, self.acked.to_string()).await?;
            tokio::fs::rename(&tmp, path).await?;
        }
        Ok(())
    }
}

pub fn checkpoint_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".offset");
    PathBuf::from(name)
}

#[async_trait]
impl EventSource for JsonlSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn fetch(&mut self, max: usize, window: Duration) -> Result<Vec<Delivery>, SourceError> {
        let deadline = Instant::now() + window;
        let mut out  = Vec::new();

        while out.len() < max {
            match self.read_line().await? {
                Some((offset, line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        out.push(Delivery::decode(PARTITION, offset, line.as_bytes()));
                    }
                }
                None if self.mode == JsonlMode::Replay => {
                    self.eof = true;
                    break;
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(POLL.min(deadline - now)).await;
                }
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, positions: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        if let Some(offset) = positions.get(&PARTITION) {
            if *offset > self.acked {
                self.acked = *offset;
                self.write_checkpoint().await?;
            }
        }
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        debug!(path = %self.path.display(), acked = self.acked, "rewinding");
        let file     = File::open(&self.path).await?;
        self.reader  = BufReader::new(file);
        self.next    = 0;
        self.partial.clear();
        self.eof     = false;
        self.skip_to(self.acked + 1).await?;
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.mode == JsonlMode::Replay && self.eof
    }
}
