use crate::factory::AsyncWriterFactory;
use anyhow::Error;
use futures_util::stream::StreamExt;
use log::{debug, warn};
use reqwest::{header, StatusCode};
use tokio::io::{copy, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// A result from a possibly-retriable operation.
pub(crate) enum RetriableResult<R, E> {
    /// Operation failed, but could be retried
    Retriable(E),
    /// Operation failed, and should not be retried
    Permanent(E),
    /// Operation succeeded
    Ok(R),
}

/// What a successful GET wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    /// Offset at which writing began; nonzero only for a resumed download
    pub resumed_from: u64,
    /// Bytes written by this request
    pub bytes: u64,
}

/// GET a URL and write it to a fresh writer from the factory.  If the factory starts past the
/// beginning, only the remainder is requested with a `Range` header.  The return value indicates
/// whether the operation can be retried.
pub(crate) async fn get_url<AWF: AsyncWriterFactory + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    writer_factory: &mut AWF,
) -> RetriableResult<Fetched, Error> {
    let start = writer_factory.start();
    let mut req = client.get(url);
    if start > 0 {
        req = req.header(header::RANGE, format!("bytes={}-", start));
    }

    let res = match req.send().await.and_then(|res| res.error_for_status()) {
        Err(err) => {
            // if this was a client error (e.g., 400), it is permanent
            if err.status().map(|s| s.is_client_error()).unwrap_or(false) {
                return RetriableResult::Permanent(err.into());
            } else {
                return RetriableResult::Retriable(err.into());
            }
        }

        Ok(res) => res,
    };

    if start > 0 && res.status() != StatusCode::PARTIAL_CONTENT {
        warn!("{} ignored the range request; downloading from the beginning", url);
        writer_factory.reset();
    }
    let resumed_from = writer_factory.start();
    debug!("GET {}: {} from offset {}", url, res.status(), resumed_from);

    // copy bytes from the response to the writer
    let stream = res
        .bytes_stream()
        // convert the Result::Err type to std::io::Error
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut reader = StreamReader::new(stream);

    let mut writer = match writer_factory.get_writer().await {
        Ok(w) => w,
        // getting a writer from the factory is not retriable
        Err(e) => return RetriableResult::Permanent(e),
    };

    let bytes = match copy(&mut reader, &mut writer).await {
        Ok(bytes) => bytes,
        // an error copying data from the remote is common and retriable
        Err(e) => return RetriableResult::Retriable(e.into()),
    };
    if let Err(e) = writer.flush().await {
        return RetriableResult::Permanent(e.into());
    }

    RetriableResult::Ok(Fetched {
        resumed_from,
        bytes,
    })
}
