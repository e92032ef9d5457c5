use crate::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// How a queried aggregate byte range relates to a span's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    None,
    Partial,
    Full,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Prior i/o against the same span has not completed; retry with
    /// backoff instead of queueing.
    #[error("backing file has unfinished i/o, retry")]
    Busy,

    #[error("storage i/o failed")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Busy)
    }
}

/// One backing file mapped into the aggregate content at `offset`.
///
/// Spans are contiguous and non-overlapping in aggregate order; a piece may
/// straddle any number of them. Reads and writes are clipped to the span's
/// true extent and performed at the span-relative position.
#[derive(Debug)]
pub struct FileSpan {
    path: PathBuf,
    length: u64,
    offset: u64,
    file: File,
    busy: bool,
}

impl FileSpan {
    /// Opens (or creates) the backing file under `root`, making parent
    /// directories as needed, and pre-sizes it to its final length so
    /// resumed sessions can read existing data back.
    pub async fn create(
        root: &Path,
        relative_path: &Path,
        length: u64,
        offset: u64,
    ) -> anyhow::Result<Self> {
        let path = root.join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        if file.metadata().await?.len() != length {
            file.set_len(length).await?;
        }

        debug!("opened span {} at offset {}", path.display(), offset);
        Ok(Self {
            path,
            length,
            offset,
            file,
            busy: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlap(&self, offset: u64, length: u64) -> Overlap {
        let (start, end) = (offset, offset + length);
        if length == 0 || end <= self.offset || start >= self.end() {
            Overlap::None
        } else if start >= self.offset && end <= self.end() {
            Overlap::Full
        } else {
            Overlap::Partial
        }
    }

    /// Writes the part of `data` (which begins at aggregate `data_offset`)
    /// that falls inside this span. Returns bytes written; 0 when the range
    /// misses the span entirely.
    pub async fn write(&mut self, data_offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        let Some((start, end)) = self.clip(data_offset, data.len() as u64) else {
            return Ok(0);
        };
        let slice = &data[(start - data_offset) as usize..(end - data_offset) as usize];

        self.begin_io()?;
        let outcome = self.write_inner(start - self.offset, slice).await;
        self.busy = false;
        outcome?;
        Ok(slice.len())
    }

    /// Reads the part of `buf` (which covers aggregate `data_offset ..`)
    /// that falls inside this span. Returns bytes read.
    pub async fn read(&mut self, data_offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let Some((start, end)) = self.clip(data_offset, buf.len() as u64) else {
            return Ok(0);
        };
        let span_relative = start - self.offset;

        self.begin_io()?;
        let outcome = async {
            self.file.seek(SeekFrom::Start(span_relative)).await?;
            let slice = &mut buf[(start - data_offset) as usize..(end - data_offset) as usize];
            self.file.read_exact(slice).await?;
            Ok::<usize, std::io::Error>(slice.len())
        }
        .await;
        self.busy = false;
        Ok(outcome?)
    }

    async fn write_inner(&mut self, span_relative: u64, data: &[u8]) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(span_relative)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    fn begin_io(&mut self) -> Result<(), StorageError> {
        if self.busy {
            warn!("span {} busy, caller must retry", self.path.display());
            return Err(StorageError::Busy);
        }
        self.busy = true;
        Ok(())
    }

    fn clip(&self, offset: u64, length: u64) -> Option<(u64, u64)> {
        let start = std::cmp::max(self.offset, offset);
        let end = std::cmp::min(self.end(), offset + length);
        (start < end).then_some((start, end))
    }

    #[cfg(test)]
    pub(crate) fn mark_busy(&mut self) {
        self.busy = true;
    }
}

/// The full backing store for one content set: every descriptor file entry
/// opened as a span, in path order, with cumulative offsets.
#[derive(Debug)]
pub struct Storage {
    spans: Vec<FileSpan>,
    total_length: u64,
}

impl Storage {
    pub async fn create(root: &Path, entries: &[(PathBuf, u64)]) -> anyhow::Result<Self> {
        let mut spans = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for (relative_path, length) in entries {
            spans.push(FileSpan::create(root, relative_path, *length, offset).await?);
            offset += length;
        }
        info!("storage ready, {} spans, {} bytes", spans.len(), offset);
        Ok(Self {
            spans,
            total_length: offset,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn spans(&self) -> &[FileSpan] {
        &self.spans
    }

    /// Writes `data` at the aggregate offset, visiting every overlapping
    /// span with a clipped write.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut written = 0;
        for span in &mut self.spans {
            if span.overlap(offset, data.len() as u64) != Overlap::None {
                written += span.write(offset, data).await?;
            }
        }
        debug_assert_eq!(written, data.len());
        Ok(())
    }

    /// Fills `buf` from the aggregate offset, visiting every overlapping
    /// span with a clipped read.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut read = 0;
        for span in &mut self.spans {
            if span.overlap(offset, buf.len() as u64) != Overlap::None {
                read += span.read(offset, buf).await?;
            }
        }
        debug_assert_eq!(read, buf.len());
        Ok(())
    }

    /// `write_at`, retrying a bounded number of times with doubling
    /// backoff while a span reports busy. Hard errors surface immediately.
    pub async fn write_at_with_retry(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut backoff = RETRY_BACKOFF;
        for attempt in 0.. {
            match self.write_at(offset, data).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < BUSY_RETRIES => {
                    trace!("storage busy, retrying write in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// `read_at` with the same busy-retry discipline.
    pub async fn read_at_with_retry(&mut self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut backoff = RETRY_BACKOFF;
        for attempt in 0.. {
            match self.read_at(offset, buf).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < BUSY_RETRIES => {
                    trace!("storage busy, retrying read in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop always returns")
    }

    #[cfg(test)]
    pub(crate) fn spans_mut(&mut self) -> &mut [FileSpan] {
        &mut self.spans
    }
}

const BUSY_RETRIES: u32 = 5;
const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(10);

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    fn span_entries() -> Vec<(PathBuf, u64)> {
        vec![
            (PathBuf::from("bundle/a.bin"), 100),
            (PathBuf::from("bundle/b.bin"), 50),
        ]
    }

    #[rstest]
    #[case(10, 20, Overlap::Full)]
    #[case(0, 100, Overlap::Full)]
    #[case(90, 20, Overlap::Partial)]
    #[case(100, 10, Overlap::None)]
    #[case(120, 5, Overlap::None)]
    #[case(0, 0, Overlap::None)]
    #[tokio::test]
    async fn test_overlap_classification(
        #[case] offset: u64,
        #[case] length: u64,
        #[case] expected: Overlap,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let span = FileSpan::create(dir.path(), Path::new("a.bin"), 100, 0)
            .await
            .unwrap();
        assert_eq!(span.overlap(offset, length), expected);
    }

    #[tokio::test]
    async fn test_straddling_write_reconstructs_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(dir.path(), &span_entries()).await.unwrap();
        assert_eq!(storage.total_length(), 150);

        // bytes [90, 150): the tail 10 bytes of the first span plus the
        // whole second span.
        let data: Vec<u8> = (0..60).map(|i| i as u8).collect();
        storage.write_at(90, &data).await.unwrap();

        let written_a = storage.spans_mut()[0].write(90, &data).await.unwrap();
        assert_eq!(written_a, 10);
        let written_b = storage.spans_mut()[1].write(90, &data).await.unwrap();
        assert_eq!(written_b, 50);

        let mut back = vec![0u8; 60];
        storage.read_at(90, &mut back).await.unwrap();
        assert_eq!(back, data);

        // the second file holds the clipped tail at its own origin.
        let raw_b = std::fs::read(dir.path().join("bundle/b.bin")).unwrap();
        assert_eq!(&raw_b[..50], &data[10..]);
    }

    #[tokio::test]
    async fn test_files_pre_sized_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(dir.path(), &span_entries()).await.unwrap();
        drop(storage);
        assert_eq!(
            std::fs::metadata(dir.path().join("bundle/a.bin")).unwrap().len(),
            100
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("bundle/b.bin")).unwrap().len(),
            50
        );
    }

    #[tokio::test]
    async fn test_busy_span_reports_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let mut span = FileSpan::create(dir.path(), Path::new("a.bin"), 100, 0)
            .await
            .unwrap();
        span.mark_busy();
        let err = span.write(0, &[1, 2, 3]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
