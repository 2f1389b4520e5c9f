//! The database side of archiving: which segments are complete, their contents, and telling the
//! database a segment may be recycled.

use std::fmt::Debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use rewind_id::Lsn;

use crate::segment::{WalSegment, segment_name};

#[async_trait]
pub trait WalSource: Debug + Send + Sync + 'static {
    /// Completed segments not yet acknowledged, in log order
    async fn ready_segments(&self) -> anyhow::Result<Vec<WalSegment>>;

    async fn read_segment(&self, segment: &WalSegment) -> anyhow::Result<Bytes>;

    /// Mark the segment archived so the database may recycle it
    async fn acknowledge(&self, segment: &WalSegment) -> anyhow::Result<()>;

    /// Ask the database to close the segment currently being written, even if it is not full.
    ///
    /// Returns `false` when there was nothing to switch, or the source cannot force a switch.
    async fn switch_segment(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

const READY_SUFFIX: &str = ".ready";
const DONE_SUFFIX: &str = ".done";

/// A [`WalSource`] over a PostgreSQL-style WAL directory.
///
/// The database drops an empty `archive_status/<segment>.ready` marker when a segment is complete;
/// acknowledging renames it to `<segment>.done`. Forcing a segment switch needs a database
/// connection, so this source leaves that to the database's own `archive_timeout`.
#[derive(Debug, Clone)]
pub struct DirectoryWalSource {
    wal_dir: PathBuf,
    segment_size: u64,
}

impl DirectoryWalSource {
    pub fn new(wal_dir: impl Into<PathBuf>, segment_size: u64) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            segment_size,
        }
    }

    fn status_dir(&self) -> PathBuf {
        self.wal_dir.join("archive_status")
    }

    fn status_file(&self, segment: &WalSegment, suffix: &str) -> PathBuf {
        self.status_dir().join(format!("{}{suffix}", segment.name))
    }
}

#[async_trait]
impl WalSource for DirectoryWalSource {
    async fn ready_segments(&self) -> anyhow::Result<Vec<WalSegment>> {
        let status_dir = self.status_dir();
        let mut entries = match tokio::fs::read_dir(&status_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", status_dir.display()));
            }
        };

        let mut segments = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(READY_SUFFIX)) else {
                continue;
            };
            match WalSegment::from_name(name, self.segment_size) {
                Some(segment) => segments.push(segment),
                // history and backup label files are also archived by postgres, but they are
                // not part of the segment stream
                None => debug!(file = name, "skipping non-segment archive status entry"),
            }
        }
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    async fn read_segment(&self, segment: &WalSegment) -> anyhow::Result<Bytes> {
        let path = self.wal_dir.join(segment.name.as_ref());
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading WAL segment {}", path.display()))?;
        Ok(Bytes::from(data))
    }

    async fn acknowledge(&self, segment: &WalSegment) -> anyhow::Result<()> {
        let ready = self.status_file(segment, READY_SUFFIX);
        let done = self.status_file(segment, DONE_SUFFIX);
        if let Err(e) = tokio::fs::rename(&ready, &done).await {
            if e.kind() == std::io::ErrorKind::NotFound && exists(&done).await {
                warn!(segment = %segment.name, "segment was already acknowledged");
                return Ok(());
            }
            return Err(e).with_context(|| format!("acknowledging {}", ready.display()));
        }
        Ok(())
    }
}

/// A [`WalSource`] kept in memory, for embedding and tests.
///
/// Data appended with [`append`](Self::append) goes to the open segment, which is completed when
/// it is full or when [`switch_segment`](WalSource::switch_segment) is called.
#[derive(Debug)]
pub struct MemoryWalSource {
    segment_size: u64,
    state: Mutex<MemoryWalState>,
}

#[derive(Debug, Default)]
struct MemoryWalState {
    /// Index of the open segment
    open_index: u64,
    open: Vec<u8>,
    ready: BTreeMap<Arc<str>, (WalSegment, Bytes)>,
    acknowledged: Vec<Arc<str>>,
}

impl MemoryWalSource {
    pub fn new(segment_size: u64) -> Self {
        Self {
            segment_size,
            state: Default::default(),
        }
    }

    /// Write to the open segment, completing it whenever it fills up
    pub fn append(&self, mut data: &[u8]) {
        let mut state = self.state.lock();
        while !data.is_empty() {
            let room = (self.segment_size as usize).saturating_sub(state.open.len()).max(1);
            let (head, tail) = data.split_at(room.min(data.len()));
            state.open.extend_from_slice(head);
            data = tail;
            if state.open.len() as u64 >= self.segment_size {
                self.complete_open(&mut state);
            }
        }
    }

    /// Names of acknowledged segments, in acknowledgement order
    pub fn acknowledged(&self) -> Vec<Arc<str>> {
        self.state.lock().acknowledged.clone()
    }

    /// Current write position
    pub fn current_lsn(&self) -> Lsn {
        let state = self.state.lock();
        Lsn::new(state.open_index * self.segment_size + state.open.len() as u64)
    }

    fn complete_open(&self, state: &mut MemoryWalState) {
        let start = Lsn::new(state.open_index * self.segment_size);
        let name = segment_name(1, start, self.segment_size);
        let Some(segment) = WalSegment::from_name(&name, self.segment_size) else {
            return;
        };
        let data = Bytes::from(std::mem::take(&mut state.open));
        state
            .ready
            .insert(Arc::clone(&segment.name), (segment, data));
        state.open_index += 1;
    }
}

#[async_trait]
impl WalSource for MemoryWalSource {
    async fn ready_segments(&self) -> anyhow::Result<Vec<WalSegment>> {
        Ok(self
            .state
            .lock()
            .ready
            .values()
            .map(|(segment, _)| segment.clone())
            .collect())
    }

    async fn read_segment(&self, segment: &WalSegment) -> anyhow::Result<Bytes> {
        self.state
            .lock()
            .ready
            .get(&segment.name)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| anyhow!("segment {} is not ready", segment.name))
    }

    async fn acknowledge(&self, segment: &WalSegment) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.ready.remove(&segment.name).is_some() {
            state.acknowledged.push(Arc::clone(&segment.name));
        }
        Ok(())
    }

    async fn switch_segment(&self) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if state.open.is_empty() {
            return Ok(false);
        }
        self.complete_open(&mut state);
        Ok(true)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::DEFAULT_SEGMENT_SIZE;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn lists_ready_segments_in_order_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("archive_status");
        std::fs::create_dir_all(&status).unwrap();
        let names: Vec<String> = [2u64, 0, 1]
            .iter()
            .map(|i| segment_name(1, Lsn::new(i * DEFAULT_SEGMENT_SIZE), DEFAULT_SEGMENT_SIZE))
            .collect();
        for name in &names {
            std::fs::write(dir.path().join(name), name.as_bytes()).unwrap();
            std::fs::write(status.join(format!("{name}.ready")), b"").unwrap();
        }
        std::fs::write(status.join("00000002.history.ready"), b"").unwrap();

        let source = DirectoryWalSource::new(dir.path(), DEFAULT_SEGMENT_SIZE);
        let ready = source.ready_segments().await.unwrap();
        let ready_names: Vec<&str> = ready.iter().map(|s| s.name.as_ref()).collect();
        assert_eq!(ready_names, vec![
            "000000010000000000000000",
            "000000010000000000000001",
            "000000010000000000000002"
        ]);

        let data = source.read_segment(&ready[0]).await.unwrap();
        assert_eq!(data.as_ref(), b"000000010000000000000000");

        source.acknowledge(&ready[0]).await.unwrap();
        // acknowledging twice is harmless
        source.acknowledge(&ready[0]).await.unwrap();
        assert!(status.join("000000010000000000000000.done").exists());
        assert_eq!(source.ready_segments().await.unwrap().len(), 2);
        assert!(!source.switch_segment().await.unwrap());
    }

    #[tokio::test]
    async fn missing_status_dir_means_nothing_ready() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryWalSource::new(dir.path(), DEFAULT_SEGMENT_SIZE);
        assert!(source.ready_segments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_source_fills_and_switches_segments() {
        let source = MemoryWalSource::new(8);
        source.append(b"0123456789");
        assert_eq!(source.current_lsn(), Lsn::new(10));

        let ready = source.ready_segments().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].end_lsn, Lsn::new(8));
        assert_eq!(source.read_segment(&ready[0]).await.unwrap().as_ref(), b"01234567");

        assert!(source.switch_segment().await.unwrap());
        assert!(!source.switch_segment().await.unwrap());
        let ready = source.ready_segments().await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(source.read_segment(&ready[1]).await.unwrap().as_ref(), b"89");

        source.acknowledge(&ready[0]).await.unwrap();
        assert_eq!(source.acknowledged(), vec![Arc::clone(&ready[0].name)]);
        assert!(source.read_segment(&ready[0]).await.is_err());
    }
}
