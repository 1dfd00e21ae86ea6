use anyhow::Result;
use async_trait::async_trait;
use std::io::{Cursor, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// An AsyncWriterFactory can produce, on demand, an [AsyncWrite] object.  In the event of a
/// download failure, the restarted download will use a fresh writer to restart writing at the
/// factory's starting position.
#[async_trait]
pub trait AsyncWriterFactory: Send {
    /// Get a fresh [AsyncWrite] object, positioned at the point where downloaded data should
    /// be written.  Anything previously written past that point is discarded.
    async fn get_writer<'a>(&'a mut self) -> Result<Box<dyn AsyncWrite + Unpin + Send + 'a>>;

    /// The byte offset at which the next writer will start.  Only resuming factories return
    /// anything but zero.
    fn start(&self) -> u64 {
        0
    }

    /// Forget any resume position, so that the next writer starts at the beginning.  Used when
    /// the server answers a range request with the whole object.
    fn reset(&mut self) {}
}

/// A CusorWriterFactory creates [AsyncWrite] objects from a [std::io::Cursor], allowing
/// downloads to in-memory buffers.  It is specialized for [Vec<u8>] (which grows indefinitely)
/// and `&mut [u8]` (which has a fixed maximum size)
pub struct CursorWriterFactory<T>(Cursor<T>);

#[async_trait]
impl AsyncWriterFactory for CursorWriterFactory<Vec<u8>> {
    async fn get_writer<'a>(&'a mut self) -> Result<Box<dyn AsyncWrite + Unpin + Send + 'a>> {
        self.0.get_mut().clear();
        self.0.set_position(0);
        Ok(Box::new(&mut self.0))
    }
}

#[async_trait]
impl AsyncWriterFactory for CursorWriterFactory<&mut [u8]> {
    async fn get_writer<'a>(&'a mut self) -> Result<Box<dyn AsyncWrite + Unpin + Send + 'a>> {
        self.0.set_position(0);
        Ok(Box::new(&mut self.0))
    }
}

impl Default for CursorWriterFactory<Vec<u8>> {
    fn default() -> Self {
        Self(Cursor::new(Vec::new()))
    }
}

impl CursorWriterFactory<Vec<u8>> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the factory, returning the vector into which the data was read
    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner()
    }
}

impl<'a> CursorWriterFactory<&'a mut [u8]> {
    pub fn for_buf(inner: &'a mut [u8]) -> Self {
        Self(Cursor::new(inner))
    }

    /// Return the size of the data written to the buffer.  This value should
    /// be used to slice the resulting data from the buffer.
    pub fn size(self) -> usize {
        self.0.position() as usize
    }
}

/// A FileWriterFactory creates [AsyncWrite] objects by truncating, seeking and cloning a
/// [tokio::fs::File].  The file must be open in write mode and must be clone-able (that is,
/// [File::try_clone()] must succeed) in order to support retried downloads.
///
/// A factory built with [`FileWriterFactory::resuming`] keeps the first `start` bytes of the
/// file and writes after them, so that a partial download can be completed with a range request.
pub struct FileWriterFactory {
    file: File,
    start: u64,
}

#[async_trait]
impl AsyncWriterFactory for FileWriterFactory {
    async fn get_writer<'a>(&'a mut self) -> Result<Box<dyn AsyncWrite + Unpin + Send + 'a>> {
        let mut file = self.file.try_clone().await?;
        file.set_len(self.start).await?;
        file.seek(SeekFrom::Start(self.start)).await?;
        Ok(Box::new(file))
    }

    fn start(&self) -> u64 {
        self.start
    }

    fn reset(&mut self) {
        self.start = 0;
    }
}

impl FileWriterFactory {
    pub fn new(file: File) -> Self {
        Self { file, start: 0 }
    }

    /// Keep the first `start` bytes already in the file and write after them.
    pub fn resuming(file: File, start: u64) -> Self {
        Self { file, start }
    }

    /// Return the File, after finishing any concurrent async operations.  The
    /// file posiion is unspecified.
    pub async fn into_inner(mut self) -> Result<File> {
        self.file.flush().await?;
        Ok(self.file)
    }
}
