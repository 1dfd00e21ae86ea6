use crate::factory::{AsyncWriterFactory, CursorWriterFactory, FileWriterFactory};
use crate::geturl::{get_url, Fetched, RetriableResult};
use anyhow::{Context, Result};
use commons::retry::{Backoff, Retry};
use commons::{Location, Resolve, Want};
use log::debug;
use tokio::fs::File;

/// Download an object to a [Vec<u8>] and return that.  If the object is unexpectedly
/// large, this may exhaust system memory and panic.  Returns (data, location)
pub async fn download_to_vec<R: Resolve + ?Sized>(
    object_id: &str,
    retry: &Retry,
    resolver: &R,
) -> Result<(Vec<u8>, Location)> {
    let mut factory = CursorWriterFactory::new();
    let (_, location) = download_with_factory(object_id, retry, resolver, &mut factory).await?;
    Ok((factory.into_inner(), location))
}

/// Download an object into the given buffer and return the slice of that buffer containing the
/// object.  If the object is larger than the buffer, then resulting error can be downcast to
/// [std::io::Error] with kind `WriteZero` and the somewhat cryptic message "write zero byte into
/// writer".  Returns (slice, location)
pub async fn download_to_buf<'a, R: Resolve + ?Sized>(
    object_id: &str,
    retry: &Retry,
    resolver: &R,
    buf: &'a mut [u8],
) -> Result<(&'a [u8], Location)> {
    let mut factory = CursorWriterFactory::for_buf(buf);
    let (_, location) = download_with_factory(object_id, retry, resolver, &mut factory).await?;
    let size = factory.size();
    Ok((&buf[..size], location))
}

/// Download an object into the given File.  The file must be open in write mode and must be
/// clone-able (that is, [File::try_clone()] must succeed) in order to support retried downloads.
/// The File is returned with all write operations complete but with unspecified position.
pub async fn download_to_file<R: Resolve + ?Sized>(
    object_id: &str,
    retry: &Retry,
    resolver: &R,
    file: File,
) -> Result<(File, Location)> {
    let mut factory = FileWriterFactory::new(file);
    let (_, location) = download_with_factory(object_id, retry, resolver, &mut factory).await?;
    Ok((factory.into_inner().await?, location))
}

/// Resolve an object and download it using an [AsyncWriterFactory].  This is useful for advanced
/// cases where one of the convenience functions is not adequate.
pub async fn download_with_factory<R, AWF>(
    object_id: &str,
    retry: &Retry,
    resolver: &R,
    writer_factory: &mut AWF,
) -> Result<(Fetched, Location)>
where
    R: Resolve + ?Sized,
    AWF: AsyncWriterFactory + ?Sized,
{
    let location = resolver.resolve(object_id, Want::Download).await?;
    let fetched = download_url_with_factory(&location.url, retry, writer_factory).await?;
    Ok((fetched, location))
}

/// Download from an already-resolved URL, retrying transient failures.  Storage downloads have
/// no timeout.
pub async fn download_url_with_factory<AWF: AsyncWriterFactory + ?Sized>(
    url: &str,
    retry: &Retry,
    writer_factory: &mut AWF,
) -> Result<Fetched> {
    let client = reqwest::Client::new();
    let mut backoff = Backoff::new(retry);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match get_url(&client, url, writer_factory).await {
            RetriableResult::Ok(fetched) => return Ok(fetched),
            RetriableResult::Retriable(err) => match backoff.next_backoff() {
                Some(duration) => {
                    debug!("GET failed, retrying in {:?}: {:#}", duration, err);
                    tokio::time::sleep(duration).await;
                    continue;
                }
                None => {
                    return Err(err).context(format!("Download failed after {} attempts", attempts))
                }
            },
            RetriableResult::Permanent(err) => {
                return Err(err);
            }
        }
    }
}
