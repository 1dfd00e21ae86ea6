//! Utilities for testing downloads
use anyhow::Result;
use async_trait::async_trait;
use commons::retry::Retry;
use commons::{Error as CommonsError, Location, Resolve, ResolutionReason, Want};
use httptest::{matchers::*, responders::*, Expectation};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PLAINTEXT_BODY: &[u8] = b"hello, world";

/// An httptest matcher that logs the matched value with `dbg!()` and always matches.
pub(crate) struct Dbg;
impl<IN> Matcher<IN> for Dbg
where
    IN: fmt::Debug + ?Sized,
{
    fn matches(&mut self, input: &IN, _ctx: &mut ExecutionContext) -> bool {
        dbg!(input);
        true
    }

    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dbg()")
    }
}

/// Event logger, used to log events from various places and then assert on them.
#[derive(Default, Clone)]
pub(crate) struct Logger {
    logged: Arc<Mutex<Vec<String>>>,
}

impl Logger {
    pub(crate) fn log<S: Into<String>>(&self, message: S) {
        self.logged.lock().unwrap().push(message.into())
    }

    pub(crate) fn assert(&self, expected: Vec<&str>) {
        assert_eq!(*self.logged.lock().unwrap(), expected);
    }
}

/// A retry policy with the default number of retries, but no waiting.
pub(crate) fn fast_retry() -> Retry {
    Retry {
        retries: 5,
        max_delay: Duration::from_millis(10),
        delay_factor: Duration::from_millis(1),
        randomization_factor: 0.0,
    }
}

/// Fake resolver placing every object, named `hello.txt` and 12 bytes long, at one URL.
pub(crate) struct FakeResolver {
    pub(crate) logger: Logger,
    url: Option<String>,
}

impl FakeResolver {
    pub(crate) fn new(url: String) -> Self {
        Self {
            logger: Logger::default(),
            url: Some(url),
        }
    }

    /// A resolver for which no object exists
    pub(crate) fn missing() -> Self {
        Self {
            logger: Logger::default(),
            url: None,
        }
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(&self, object_id: &str, _want: Want<'_>) -> Result<Location> {
        self.logger.log(format!("resolve {}", object_id));
        match &self.url {
            Some(url) => Ok(Location {
                object_id: object_id.to_owned(),
                url: url.clone(),
                file_name: "hello.txt".to_owned(),
                size: Some(PLAINTEXT_BODY.len() as u64),
            }),
            None => Err(CommonsError::resolution(object_id, ResolutionReason::NotFound).into()),
        }
    }

    async fn create_upload(&self, _file_name: &str, _size: Option<u64>) -> Result<Location> {
        unimplemented!()
    }

    async fn delete(&self, _object_id: &str) -> Result<()> {
        unimplemented!()
    }
}

/// A fake server of data blobs (like S3, but not trying to actually emulate S3).  Serves
/// b"hello, world" at the given URL.
pub(crate) struct FakeDataServer {
    server: httptest::Server,
}

impl FakeDataServer {
    /// Build an httptest::Server that responds with a sequence of responses.  For 200,
    /// the body is "hello, world".
    pub(crate) fn new(responses: &[u16]) -> Self {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(all_of![Dbg, request::method_path("GET", "/data"),])
                .times(..=responses.len())
                .respond_with(cycle(
                    responses
                        .iter()
                        .map(|response| {
                            let responder: Box<dyn Responder> = Box::new(if *response == 200 {
                                status_code(200)
                                    .append_header("Content-Type", "text/plain")
                                    .body(PLAINTEXT_BODY)
                            } else {
                                status_code(*response).body(&b""[..])
                            });
                            responder
                        })
                        .collect(),
                )),
        );
        Self { server }
    }

    pub(crate) fn data_url(&self) -> String {
        self.server.url_str("/data")
    }
}
