//! Trait wrapper around the broker's multipart methods to allow fake injection during tests.
use anyhow::Error;
use async_trait::async_trait;
use commons::services::{Fence, MultipartSession};
use serde_json::Value;

/// The multipart-session methods of the broker.
#[async_trait]
pub trait MultipartService: Send + Sync {
    async fn multipart_init(
        &self,
        file_name: &str,
        object_id: Option<&str>,
    ) -> std::result::Result<MultipartSession, Error>;

    async fn multipart_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> std::result::Result<String, Error>;

    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &Value,
    ) -> std::result::Result<(), Error>;
}

/// Trivial implementation of the MultipartService trait for the Fence client struct
#[async_trait]
impl MultipartService for Fence {
    async fn multipart_init(
        &self,
        file_name: &str,
        object_id: Option<&str>,
    ) -> std::result::Result<MultipartSession, Error> {
        (self as &Fence).multipart_init(file_name, object_id).await
    }

    async fn multipart_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> std::result::Result<String, Error> {
        (self as &Fence)
            .multipart_upload_url(key, upload_id, part_number)
            .await
    }

    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &Value,
    ) -> std::result::Result<(), Error> {
        (self as &Fence)
            .multipart_complete(key, upload_id, parts)
            .await
    }
}
