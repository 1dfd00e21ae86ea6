//! Chunked uploads.
//!
//! A session is opened with the broker, each chunk is PUT to its own presigned URL in increasing
//! order, and the session is completed with the ordered part manifest.  Sessions are never
//! resumed: a failed multipart upload starts again from part 1.
use crate::factory::AsyncReaderFactory;
use crate::service::MultipartService;
use crate::{put_with_retry, retry_step, RegisteredObject, Span, UploadConfig};
use anyhow::{Context, Result};
use commons::Error as CommonsError;
use log::debug;
use serde::Serialize;

/// One uploaded part, as the storage backend identified it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartDescriptor {
    /// 1-based, contiguous
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    /// Opaque integrity tag (the `ETag` response header)
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Number of chunks needed for `size` bytes.  An empty object is still one (empty) part.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    debug_assert!(chunk_size > 0);
    if size == 0 {
        1
    } else {
        (size + chunk_size - 1) / chunk_size
    }
}

/// The ordered parts of one session.  Parts must arrive in sequence, and the manifest can only
/// be finished once every expected part is present.
#[derive(Debug)]
pub struct PartManifest {
    expected: u32,
    parts: Vec<PartDescriptor>,
}

impl PartManifest {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            parts: Vec::with_capacity(expected as usize),
        }
    }

    pub fn push(&mut self, part: PartDescriptor) -> Result<()> {
        let next = self.parts.len() as u32 + 1;
        if part.part_number != next || next > self.expected {
            return Err(CommonsError::Transfer(format!(
                "part {} is out of order; expected part {} of {}",
                part.part_number, next, self.expected
            ))
            .into());
        }
        self.parts.push(part);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The complete, ordered manifest.  Anything short of all expected parts is an error.
    pub fn finish(self) -> Result<Vec<PartDescriptor>> {
        if self.parts.len() as u32 != self.expected {
            return Err(CommonsError::Transfer(format!(
                "part count mismatch: collected {} of {} parts",
                self.parts.len(),
                self.expected
            ))
            .into());
        }
        Ok(self.parts)
    }

    /// Rebuild a manifest from parts collected elsewhere, checking order as [`push`](Self::push) does.
    pub fn from_parts(expected: u32, parts: Vec<PartDescriptor>) -> Result<Self> {
        let mut manifest = Self::new(expected);
        for part in parts {
            manifest.push(part)?;
        }
        Ok(manifest)
    }
}

/// The result of a successful multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub object_id: String,
    pub parts: u32,
}

/// Upload `size` bytes from the factory in parts of `config.chunk_size`.  Without an object id,
/// the session registers a new object; any failure after that carries a [`RegisteredObject`]
/// context so the caller can clean up.
pub async fn upload_multipart<M, ARF>(
    service: &M,
    file_name: &str,
    object_id: Option<&str>,
    size: u64,
    reader_factory: &mut ARF,
    config: &UploadConfig,
) -> Result<MultipartUpload>
where
    M: MultipartService + ?Sized,
    ARF: AsyncReaderFactory,
{
    let session = retry_step(&config.retry, "multipart init", || {
        service.multipart_init(file_name, object_id)
    })
    .await?;

    let registered = session.guid.clone();
    let res = upload_parts(
        service,
        file_name,
        &session.guid,
        &session.upload_id,
        size,
        reader_factory,
        config,
    )
    .await;
    match res {
        Ok(parts) => Ok(MultipartUpload {
            object_id: session.guid,
            parts,
        }),
        Err(err) if object_id.is_none() => Err(err.context(RegisteredObject(registered))),
        Err(err) => Err(err),
    }
}

fn part_etag(resp: &reqwest::Response, part_number: u32, key: &str) -> Result<String> {
    resp.headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            CommonsError::Transfer(format!(
                "storage returned no ETag for part {} of {}",
                part_number, key
            ))
            .into()
        })
}

async fn upload_parts<M, ARF>(
    service: &M,
    file_name: &str,
    guid: &str,
    upload_id: &str,
    size: u64,
    reader_factory: &mut ARF,
    config: &UploadConfig,
) -> Result<u32>
where
    M: MultipartService + ?Sized,
    ARF: AsyncReaderFactory,
{
    let retry = &config.retry;
    let chunk_size = config.chunk_size;
    let client = config.storage_client()?;
    let key = format!("{}/{}", guid, file_name);
    let key = key.as_str();
    let total = u32::try_from(chunk_count(size, chunk_size))
        .map_err(|_| CommonsError::Transfer(format!("{} needs too many parts", file_name)))?;
    let mut manifest = PartManifest::new(total);

    for part_number in 1..=total {
        let offset = (part_number as u64 - 1) * chunk_size;
        let len = chunk_size.min(size - offset);

        let url = retry_step(retry, "multipart part URL", || {
            service.multipart_upload_url(key, upload_id, part_number)
        })
        .await?;

        // a part without an ETag cannot be completed, so it is sent again
        let etag = put_with_retry(
            &client,
            &url,
            len,
            retry,
            reader_factory,
            Span::Range { offset, len },
            |resp| part_etag(resp, part_number, key),
        )
        .await
        .with_context(|| format!("while uploading part {} of {}", part_number, total))?;
        debug!("{}: part {}/{} uploaded", key, part_number, total);
        manifest.push(PartDescriptor { part_number, etag })?;
    }

    let parts = serde_json::to_value(manifest.finish()?)?;
    retry_step(retry, "multipart complete", || {
        service.multipart_complete(key, upload_id, &parts)
    })
    .await?;
    Ok(total)
}
