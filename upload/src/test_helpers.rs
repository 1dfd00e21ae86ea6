//! Utilities for testing uploads
use crate::service::MultipartService;
use anyhow::{Error, Result};
use async_trait::async_trait;
use commons::retry::Retry;
use commons::services::MultipartSession;
use commons::{Location, Resolve, Want};
use httptest::matchers::{ExecutionContext, Matcher};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

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

/// A retry policy with the same number of retries as the default, but no waiting.
pub(crate) fn fast_retry() -> Retry {
    Retry {
        retries: 5,
        max_delay: Duration::from_millis(10),
        delay_factor: Duration::from_millis(1),
        randomization_factor: 0.0,
    }
}

/// Fake resolver that hands out a fixed upload URL
pub(crate) struct FakeResolver {
    pub(crate) logger: Logger,
    url: String,
}

impl FakeResolver {
    pub(crate) fn new(url: String) -> Self {
        Self {
            logger: Logger::default(),
            url,
        }
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(&self, object_id: &str, want: Want<'_>) -> Result<Location> {
        let file_name = match want {
            Want::Upload { file_name } => {
                self.logger
                    .log(format!("resolve {} upload {}", object_id, file_name));
                file_name
            }
            Want::Download => {
                self.logger.log(format!("resolve {} download", object_id));
                "data"
            }
        };
        Ok(Location {
            object_id: object_id.to_owned(),
            url: self.url.clone(),
            file_name: file_name.to_owned(),
            size: None,
        })
    }

    async fn create_upload(&self, file_name: &str, size: Option<u64>) -> Result<Location> {
        self.logger
            .log(format!("create {} {:?}", file_name, size));
        Ok(Location {
            object_id: "new-guid".to_owned(),
            url: self.url.clone(),
            file_name: file_name.to_owned(),
            size,
        })
    }

    async fn delete(&self, object_id: &str) -> Result<()> {
        self.logger.log(format!("delete {}", object_id));
        Ok(())
    }
}

/// Fake broker handing out part URLs `{storage}{part_number}`
pub(crate) struct FakeMultipart {
    pub(crate) logger: Logger,
    storage: String,
    /// Number of upcoming part-URL requests that fail
    pub(crate) fail_urls: Mutex<u32>,
}

impl FakeMultipart {
    pub(crate) fn new(storage: String) -> Self {
        Self {
            logger: Logger::default(),
            storage,
            fail_urls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl MultipartService for FakeMultipart {
    async fn multipart_init(
        &self,
        file_name: &str,
        object_id: Option<&str>,
    ) -> std::result::Result<MultipartSession, Error> {
        self.logger
            .log(format!("init {} {:?}", file_name, object_id));
        Ok(MultipartSession {
            guid: object_id.unwrap_or("g-new").to_owned(),
            upload_id: "up-1".to_owned(),
        })
    }

    async fn multipart_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> std::result::Result<String, Error> {
        {
            let mut fail = self.fail_urls.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                self.logger.log(format!("url {} failed", part_number));
                anyhow::bail!("broker hiccup");
            }
        }
        self.logger
            .log(format!("url {} {} {}", key, upload_id, part_number));
        Ok(format!("{}{}", self.storage, part_number))
    }

    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &Value,
    ) -> std::result::Result<(), Error> {
        self.logger
            .log(format!("complete {} {} {}", key, upload_id, parts));
        Ok(())
    }
}
