/*! Support for uploading data to a data commons.

This crate performs the byte-moving half of an upload: given a location from a
[`commons::Resolve`] implementation, it PUTs the data to object storage, either in one request or
as a multipart session negotiated with the broker.

Files smaller than [`UploadConfig::multipart_threshold`] are sent with a single PUT to a presigned
URL.  Larger files (or any file, with [`UploadConfig::force_multipart`]) are split into
[`UploadConfig::chunk_size`] parts, uploaded strictly in order, and the session is completed with
the ordered part manifest.  See [`upload_multipart`].

## Convenience Functions

Most uses of this crate can utilize [upload_file] or [upload_from_buf], providing the data in the
form of a path and a buffer, respectively.

## Factories

An upload may be retried, in which case the upload function must have access to the object data
from the beginning, and a multipart upload needs each part's byte range.  This is accomplished with
the [`AsyncReaderFactory`](crate::AsyncReaderFactory) trait, which generates a fresh
[tokio::io::AsyncRead] for each attempt.

## Newly Registered Objects

Uploading without an object id registers a new object before any data moves.  If the upload then
fails, the error carries a [`RegisteredObject`] context with the new id, so that the caller can
delete it if it gives up on the upload:

```
# use commons_upload::RegisteredObject;
# fn cleanup(err: anyhow::Error) {
if let Some(RegisteredObject(object_id)) = err.downcast_ref::<RegisteredObject>() {
    println!("abandoning {}", object_id);
}
# }
```
 */
use anyhow::{Context, Result};
use commons::retry::{Backoff, Retry};
use commons::{err_status_code, error_kind, Error as CommonsError, Resolve, Want};
use log::debug;
use reqwest::Body;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio_util::codec::{BytesCodec, FramedRead};

mod factory;
mod multipart;
mod service;

#[cfg(test)]
mod test_helpers;

pub use factory::{AsyncReaderFactory, CursorReaderFactory, FileReaderFactory};
pub use multipart::{chunk_count, upload_multipart, MultipartUpload, PartDescriptor, PartManifest};
pub use service::MultipartService;

/// Files at least this large use multipart uploads (5 GiB)
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

/// Default multipart part size (10 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// How uploads are performed.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    pub force_multipart: bool,
    /// Retry policy for each request: the single PUT, or each multipart sub-step
    pub retry: Retry,
    /// Limit on establishing a connection to storage
    pub connect_timeout: Duration,
    /// Limit on any one read from storage, such as waiting for the response to a PUT.  Storage
    /// transfers have no overall deadline, since a large part can take a long time to send.
    pub read_timeout: Duration,
    storage: Arc<OnceLock<reqwest::Client>>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            force_multipart: false,
            retry: Retry::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            storage: Arc::default(),
        }
    }
}

impl UploadConfig {
    /// The HTTP client for storage PUTs.  It is built on first use and then shared by this
    /// config and its clones, so connections are reused across parts and files.
    pub(crate) fn storage_client(&self) -> Result<reqwest::Client> {
        if let Some(client) = self.storage.get() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .build()
            .context("while building the storage client")?;
        Ok(self.storage.get_or_init(|| client).clone())
    }

    pub fn mode_for(&self, size: u64) -> UploadMode {
        if self.force_multipart || size >= self.multipart_threshold {
            UploadMode::Multipart
        } else {
            UploadMode::Simple
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Simple,
    Multipart,
}

/// The result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub object_id: String,
    pub mode: UploadMode,
    pub parts: u32,
}

/// Context attached to upload failures that happened after a new object was registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredObject(pub String);

impl fmt::Display for RegisteredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload of registered object {} failed", self.0)
    }
}

/// Upload a local file.  Without an object id, a new object is registered.
pub async fn upload_file<R, M>(
    path: &Path,
    file_name: &str,
    object_id: Option<&str>,
    config: &UploadConfig,
    resolver: &R,
    multipart: &M,
) -> Result<Uploaded>
where
    R: Resolve + ?Sized,
    M: MultipartService + ?Sized,
{
    let file = File::open(path)
        .await
        .map_err(|e| CommonsError::local_io(path, e))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| CommonsError::local_io(path, e))?
        .len();
    upload_with_factory(
        FileReaderFactory::new(file),
        size,
        file_name,
        object_id,
        config,
        resolver,
        multipart,
    )
    .await
}

/// Upload an object from an in-memory buffer.
pub async fn upload_from_buf<R, M>(
    data: &[u8],
    file_name: &str,
    object_id: Option<&str>,
    config: &UploadConfig,
    resolver: &R,
    multipart: &M,
) -> Result<Uploaded>
where
    R: Resolve + ?Sized,
    M: MultipartService + ?Sized,
{
    upload_with_factory(
        CursorReaderFactory::new(data),
        data.len() as u64,
        file_name,
        object_id,
        config,
        resolver,
        multipart,
    )
    .await
}

/// Upload an object using an AsyncReaderFactory.  This is useful for advanced cases where one of
/// the convenience functions is not adequate.
pub async fn upload_with_factory<ARF, R, M>(
    mut reader_factory: ARF,
    size: u64,
    file_name: &str,
    object_id: Option<&str>,
    config: &UploadConfig,
    resolver: &R,
    multipart: &M,
) -> Result<Uploaded>
where
    ARF: AsyncReaderFactory,
    R: Resolve + ?Sized,
    M: MultipartService + ?Sized,
{
    match config.mode_for(size) {
        UploadMode::Multipart => {
            let res =
                upload_multipart(multipart, file_name, object_id, size, &mut reader_factory, config)
                    .await?;
            Ok(Uploaded {
                object_id: res.object_id,
                mode: UploadMode::Multipart,
                parts: res.parts,
            })
        }
        UploadMode::Simple => {
            let (location, registered) = match object_id {
                Some(id) => (resolver.resolve(id, Want::Upload { file_name }).await?, false),
                None => (resolver.create_upload(file_name, Some(size)).await?, true),
            };
            let res = put_with_retry(
                &config.storage_client()?,
                &location.url,
                size,
                &config.retry,
                &mut reader_factory,
                Span::Whole,
                |_| Ok(()),
            )
            .await;
            match res {
                Ok(_) => Ok(Uploaded {
                    object_id: location.object_id,
                    mode: UploadMode::Simple,
                    parts: 1,
                }),
                Err(err) if registered => Err(err.context(RegisteredObject(location.object_id))),
                Err(err) => Err(err),
            }
        }
    }
}

/// Which bytes of the factory's data a PUT carries.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Span {
    Whole,
    Range { offset: u64, len: u64 },
}

/// Failures that another attempt might fix: not a 4xx, and not classified as permanent.
fn is_transient(err: &anyhow::Error) -> bool {
    if err_status_code(err)
        .map(|s| s.is_client_error())
        .unwrap_or(false)
    {
        return false;
    }
    error_kind(err).is_retriable()
}

/// Run one step of an upload, retrying transient failures with backoff.
pub(crate) async fn retry_step<T, F, Fut>(retry: &Retry, what: &str, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(retry);
    let mut attempts = 0u32;
    loop {
        let err = match step().await {
            Ok(v) => return Ok(v),
            Err(err) => err,
        };
        attempts += 1;
        if !is_transient(&err) {
            return Err(err);
        }
        match backoff.next_backoff() {
            Some(duration) => {
                debug!("{} failed, retrying in {:?}: {:#}", what, duration, err);
                tokio::time::sleep(duration).await
            }
            None => return Err(err.context(format!("{} failed after {} attempts", what, attempts))),
        }
    }
}

/// PUT the given span of data to a presigned URL, retrying transient failures with a fresh
/// reader each time.  A 2xx response is passed to `accept`, whose errors are retried like any
/// other failure of the PUT.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn put_with_retry<ARF, T, F>(
    client: &reqwest::Client,
    url: &str,
    content_length: u64,
    retry: &Retry,
    reader_factory: &mut ARF,
    span: Span,
    accept: F,
) -> Result<T>
where
    ARF: AsyncReaderFactory + ?Sized,
    F: Fn(&reqwest::Response) -> Result<T>,
{
    let mut backoff = Backoff::new(retry);
    let mut attempts = 0u32;
    loop {
        let reader = match span {
            Span::Whole => reader_factory.get_reader().await?,
            Span::Range { offset, len } => reader_factory.get_range_reader(offset, len).await?,
        };
        let res = simple_put(client, url, content_length, reader).await;
        let err = match res.and_then(|resp| accept(&resp)) {
            Ok(v) => return Ok(v),
            Err(err) => err,
        };

        attempts += 1;
        if !is_transient(&err) {
            return Err(err);
        }
        match backoff.next_backoff() {
            Some(duration) => {
                debug!("PUT failed, retrying in {:?}: {:#}", duration, err);
                tokio::time::sleep(duration).await
            }
            None => return Err(err.context(format!("Upload failed after {} attempts", attempts))),
        }
    }
}

/// Perform a single PUT; non-2xx responses are errors.
async fn simple_put(
    client: &reqwest::Client,
    url: &str,
    content_length: u64,
    reader: Box<dyn AsyncRead + Sync + Send + Unpin + 'static>,
) -> Result<reqwest::Response> {
    let stream = FramedRead::new(reader, BytesCodec::new());
    let resp = client
        .put(url)
        .header("Content-Length", content_length)
        .body(Body::wrap_stream(stream))
        .send()
        .await
        .context("while sending data to storage")?;
    Ok(resp.error_for_status()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{fast_retry, Dbg, FakeMultipart, FakeResolver};
    use commons::ErrorKind;
    use httptest::{
        matchers::{all_of, contains, request},
        responders::{delay_and_then, status_code},
        Expectation, Server,
    };
    use std::io::Write;

    fn config(threshold: u64) -> UploadConfig {
        UploadConfig {
            multipart_threshold: threshold,
            chunk_size: 4,
            retry: fast_retry(),
            ..UploadConfig::default()
        }
    }

    #[test]
    fn mode_boundaries() {
        let config = config(10);
        assert_eq!(config.mode_for(9), UploadMode::Simple);
        assert_eq!(config.mode_for(10), UploadMode::Multipart);
        let forced = UploadConfig {
            force_multipart: true,
            ..config
        };
        assert_eq!(forced.mode_for(1), UploadMode::Multipart);
    }

    #[test]
    fn defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.multipart_threshold, 5 << 30);
        assert_eq!(config.chunk_size, 10 << 20);
        assert_eq!(config.read_timeout, Duration::from_secs(120));
    }

    #[test]
    fn storage_client_is_shared_by_clones() -> Result<()> {
        let config = UploadConfig::default();
        let copy = config.clone();
        copy.storage_client()?;
        assert!(config.storage.get().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn hung_storage_times_out() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/data"))
                .times(1..)
                .respond_with(delay_and_then(Duration::from_secs(2), status_code(200))),
        );
        let resolver = FakeResolver::new(server.url_str("/data"));
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());
        let config = UploadConfig {
            read_timeout: Duration::from_millis(50),
            retry: Retry {
                retries: 1,
                ..fast_retry()
            },
            ..config(100)
        };

        let started = std::time::Instant::now();
        let err = upload_from_buf(b"hi", "hi.txt", Some("abc"), &config, &resolver, &multipart)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err
            .chain()
            .filter_map(|e| e.downcast_ref::<reqwest::Error>())
            .any(|e| e.is_timeout()));
        // a timeout is worth another attempt by the batch
        assert_eq!(error_kind(&err), ErrorKind::Transfer);
        Ok(())
    }

    #[tokio::test]
    async fn simple_upload_existing_object() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                Dbg,
                request::method_path("PUT", "/data"),
                request::body("hello, world"),
                request::headers(contains(("content-length", "12"))),
            ])
            .times(1)
            .respond_with(status_code(200)),
        );
        let resolver = FakeResolver::new(server.url_str("/data"));
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());

        let res = upload_from_buf(
            b"hello, world",
            "hello.txt",
            Some("abc"),
            &config(100),
            &resolver,
            &multipart,
        )
        .await?;
        assert_eq!(
            res,
            Uploaded {
                object_id: "abc".to_owned(),
                mode: UploadMode::Simple,
                parts: 1
            }
        );
        resolver.logger.assert(vec!["resolve abc upload hello.txt"]);
        multipart.logger.assert(vec![]);
        Ok(())
    }

    #[tokio::test]
    async fn simple_upload_new_object() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/data"))
                .times(1)
                .respond_with(status_code(200)),
        );
        let resolver = FakeResolver::new(server.url_str("/data"));
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());

        let res = upload_from_buf(
            b"hi",
            "hi.txt",
            None,
            &config(100),
            &resolver,
            &multipart,
        )
        .await?;
        assert_eq!(res.object_id, "new-guid");
        resolver.logger.assert(vec!["create hi.txt Some(2)"]);
        Ok(())
    }

    #[tokio::test]
    async fn simple_upload_server_error_is_retried() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/data"))
                .times(6) // 1 try, 5 retries
                .respond_with(status_code(500)),
        );
        let resolver = FakeResolver::new(server.url_str("/data"));
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());

        let err = upload_from_buf(b"hi", "hi.txt", None, &config(100), &resolver, &multipart)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Transfer);
        assert_eq!(
            err.downcast_ref::<RegisteredObject>(),
            Some(&RegisteredObject("new-guid".to_owned()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn simple_upload_client_error_not_retried() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/data"))
                .times(1)
                .respond_with(status_code(403)),
        );
        let resolver = FakeResolver::new(server.url_str("/data"));
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());

        let err = upload_from_buf(b"hi", "hi.txt", Some("abc"), &config(100), &resolver, &multipart)
            .await
            .unwrap_err();
        assert_eq!(
            err_status_code(&err),
            Some(commons::StatusCode::FORBIDDEN)
        );
        // an existing object is not ours to clean up
        assert!(err.downcast_ref::<RegisteredObject>().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn large_file_goes_multipart() -> Result<()> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("PUT"))
                .times(3)
                .respond_with(status_code(200).insert_header("ETag", "\"tag\"")),
        );
        let resolver = FakeResolver::new(server.url_str("/unused"));
        let multipart = FakeMultipart::new(server.url_str("/part"));

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"0123456789")?;
        let res = upload_file(
            file.path(),
            "digits.txt",
            None,
            &config(10),
            &resolver,
            &multipart,
        )
        .await?;
        assert_eq!(res.mode, UploadMode::Multipart);
        assert_eq!(res.parts, 3);
        resolver.logger.assert(vec![]);
        multipart.logger.assert(vec![
            "init digits.txt None",
            "url g-new/digits.txt up-1 1",
            "url g-new/digits.txt up-1 2",
            "url g-new/digits.txt up-1 3",
            r#"complete g-new/digits.txt up-1 [{"ETag":"\"tag\"","PartNumber":1},{"ETag":"\"tag\"","PartNumber":2},{"ETag":"\"tag\"","PartNumber":3}]"#,
        ]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_local_io() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let resolver = FakeResolver::new("http://unused.example.org/".to_owned());
        let multipart = FakeMultipart::new("http://unused.example.org/part".to_owned());
        let err = upload_file(
            &dir.path().join("nope.txt"),
            "nope.txt",
            None,
            &config(10),
            &resolver,
            &multipart,
        )
        .await
        .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::LocalIo);
        assert!(!error_kind(&err).is_retriable());
        resolver.logger.assert(vec![]);
        Ok(())
    }
}
