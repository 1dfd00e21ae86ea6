use anyhow::Result;
use async_trait::async_trait;
use std::io::{Cursor, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// An AsyncReaderFactory can produce, on demand, an AsyncReader.  In the event of an upload
/// failure, the restarted upload will use a fresh reader to start reading object content
/// at the beginning.  Multipart uploads ask for one byte range per part instead.
#[async_trait]
pub trait AsyncReaderFactory: Send {
    async fn get_reader(&mut self) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>>;

    /// A reader over exactly `len` bytes starting at `offset`.
    async fn get_range_reader(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>>;
}

/// A CusorReaderFactory creates AsyncReaders from a `std::io::Cursor`, allowing uploads from
/// in-memory buffers.  Note that this struct clones the given data for each retry.
pub struct CursorReaderFactory(Vec<u8>);

#[async_trait]
impl AsyncReaderFactory for CursorReaderFactory {
    async fn get_reader(&mut self) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>> {
        Ok(Box::new(Cursor::new(self.0.clone())))
    }

    async fn get_range_reader(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>> {
        let start = (offset as usize).min(self.0.len());
        let end = (offset.saturating_add(len) as usize).min(self.0.len());
        Ok(Box::new(Cursor::new(self.0[start..end].to_vec())))
    }
}

impl CursorReaderFactory {
    pub fn new(buf: &[u8]) -> Self {
        Self(buf.to_vec())
    }
}

/// A FileReaderFactory creates AsyncReaders by seeking and cloning a file.  The given
/// file must be clonable (that is, `try_clone()` must succeed).
pub struct FileReaderFactory(File);

#[async_trait]
impl AsyncReaderFactory for FileReaderFactory {
    async fn get_reader<'a>(
        &'a mut self,
    ) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>> {
        let mut file = self.0.try_clone().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file))
    }

    async fn get_range_reader(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<Box<dyn AsyncRead + Sync + Send + Unpin + 'static>> {
        let mut file = self.0.try_clone().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(len)))
    }
}

impl FileReaderFactory {
    pub fn new(file: File) -> Self {
        Self(file)
    }
}
