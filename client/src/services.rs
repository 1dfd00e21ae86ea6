//! Typed clients for the three commons backends, and traits wrapping them so that callers can
//! inject fakes in tests.
//!
//! * [`Shepherd`] is the unified metadata/storage API, under `mds/`;
//! * [`Indexd`] is the legacy index service, under `index/`;
//! * [`Fence`] is the legacy auth/download broker, under `user/`.
//!
//! Each has a `new` associated function that takes an `Into<ClientBuilder>`, and a `from_client`
//! that shares an existing client's connection pool and access token.
use crate::{Client, ClientBuilder};
use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Object metadata as returned by the unified API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShepherdRecord {
    pub file_name: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// An index record.  Records registered outside this client may lack a name or size.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IndexRecord {
    #[serde(default)]
    pub did: String,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// A newly registered object and the presigned URL to upload its data to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedObject {
    pub guid: String,
    #[serde(alias = "upload_url")]
    pub url: String,
}

/// The request body for registering a new object with the unified API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewObject {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub aliases: Vec<String>,
    pub metadata: Value,
}

impl NewObject {
    pub fn new<S: Into<String>>(file_name: S) -> Self {
        NewObject {
            file_name: file_name.into(),
            size: None,
            aliases: vec![],
            metadata: json!({}),
        }
    }
}

/// A multipart upload session opened with the broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MultipartSession {
    pub guid: String,
    #[serde(rename = "uploadId")]
    pub upload_id: String,
}

#[derive(Deserialize)]
struct UrlResponse {
    url: String,
}

async fn json_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<T> {
    resp.json::<T>()
        .await
        .with_context(|| format!("while decoding {} response", what))
}

/// The unified metadata/storage API
#[derive(Debug, Clone)]
pub struct Shepherd {
    pub client: Client,
}

impl Shepherd {
    pub fn new<CB: Into<ClientBuilder>>(client_builder: CB) -> Result<Self, Error> {
        let client = client_builder
            .into()
            .path_prefix("mds/")
            .service("shepherd")
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: &Client) -> Result<Self, Error> {
        Ok(Self {
            client: client.for_backend("mds/", "shepherd")?,
        })
    }

    /// The deployed API version, a semantic version string.
    pub async fn version(&self) -> Result<String, Error> {
        let resp = self.client.request("GET", "version", None, None).await?;
        json_response(resp, "version").await
    }

    pub async fn object(&self, object_id: &str) -> Result<ShepherdRecord, Error> {
        #[derive(Deserialize)]
        struct ObjectResponse {
            record: ShepherdRecord,
        }
        let resp = self
            .client
            .request("GET", &format!("objects/{}", object_id), None, None)
            .await?;
        Ok(json_response::<ObjectResponse>(resp, "object").await?.record)
    }

    pub async fn download_url(&self, object_id: &str) -> Result<String, Error> {
        let resp = self
            .client
            .request(
                "GET",
                &format!("objects/{}/download", object_id),
                None,
                None,
            )
            .await?;
        Ok(json_response::<UrlResponse>(resp, "download").await?.url)
    }

    pub async fn create_object(&self, object: &NewObject) -> Result<CreatedObject, Error> {
        let body = serde_json::to_value(object)?;
        let resp = self
            .client
            .request("POST", "objects", None, Some(&body))
            .await?;
        json_response(resp, "create object").await
    }

    pub async fn delete_object(&self, object_id: &str) -> Result<(), Error> {
        self.client
            .request("DELETE", &format!("objects/{}", object_id), None, None)
            .await?;
        Ok(())
    }
}

/// The legacy index service
#[derive(Debug, Clone)]
pub struct Indexd {
    pub client: Client,
}

impl Indexd {
    pub fn new<CB: Into<ClientBuilder>>(client_builder: CB) -> Result<Self, Error> {
        let client = client_builder
            .into()
            .path_prefix("index/")
            .service("indexd")
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: &Client) -> Result<Self, Error> {
        Ok(Self {
            client: client.for_backend("index/", "indexd")?,
        })
    }

    pub async fn record(&self, object_id: &str) -> Result<IndexRecord, Error> {
        let resp = self
            .client
            .request("GET", &format!("index/{}", object_id), None, None)
            .await?;
        json_response(resp, "index record").await
    }
}

/// The legacy auth and download broker
#[derive(Debug, Clone)]
pub struct Fence {
    pub client: Client,
}

impl Fence {
    pub fn new<CB: Into<ClientBuilder>>(client_builder: CB) -> Result<Self, Error> {
        let client = client_builder
            .into()
            .path_prefix("user/")
            .service("fence")
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: &Client) -> Result<Self, Error> {
        Ok(Self {
            client: client.for_backend("user/", "fence")?,
        })
    }

    /// Presigned download URL, optionally for a particular storage protocol (`s3`, `gs`, ..)
    pub async fn download_url(
        &self,
        object_id: &str,
        protocol: Option<&str>,
    ) -> Result<String, Error> {
        let query = protocol.map(|p| vec![("protocol", p)]);
        let resp = self
            .client
            .request("GET", &format!("data/download/{}", object_id), query, None)
            .await?;
        Ok(json_response::<UrlResponse>(resp, "download").await?.url)
    }

    /// Register a new object and get a presigned URL for its data.
    pub async fn new_upload(&self, file_name: &str) -> Result<CreatedObject, Error> {
        let body = json!({ "file_name": file_name });
        let resp = self
            .client
            .request("POST", "data/upload", None, Some(&body))
            .await?;
        json_response(resp, "upload").await
    }

    /// Presigned upload URL for an already-registered object.
    pub async fn upload_url(&self, object_id: &str, file_name: &str) -> Result<String, Error> {
        let resp = self
            .client
            .request(
                "GET",
                &format!("data/upload/{}", object_id),
                Some(vec![("file_name", file_name)]),
                None,
            )
            .await?;
        Ok(json_response::<UrlResponse>(resp, "upload").await?.url)
    }

    /// Open a multipart session.  Without an object id, a new object is registered.
    pub async fn multipart_init(
        &self,
        file_name: &str,
        object_id: Option<&str>,
    ) -> Result<MultipartSession, Error> {
        let mut body = json!({ "file_name": file_name });
        if let Some(id) = object_id {
            body["guid"] = json!(id);
        }
        let resp = self
            .client
            .request("POST", "data/multipart/init", None, Some(&body))
            .await?;
        json_response(resp, "multipart init").await
    }

    /// Presigned URL for one part of a multipart session.  Parts are numbered from 1.
    pub async fn multipart_upload_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String, Error> {
        #[derive(Deserialize)]
        struct PartUrl {
            presigned_url: String,
        }
        let body = json!({ "key": key, "uploadId": upload_id, "partNumber": part_number });
        let resp = self
            .client
            .request("POST", "data/multipart/upload", None, Some(&body))
            .await?;
        Ok(json_response::<PartUrl>(resp, "multipart upload")
            .await?
            .presigned_url)
    }

    /// Complete a multipart session; `parts` is the ordered part manifest.
    pub async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &Value,
    ) -> Result<(), Error> {
        let body = json!({ "key": key, "uploadId": upload_id, "parts": parts });
        self.client
            .request("POST", "data/multipart/complete", None, Some(&body))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, object_id: &str) -> Result<(), Error> {
        self.client
            .request("DELETE", &format!("data/{}", object_id), None, None)
            .await?;
        Ok(())
    }
}

/// A wrapper around the necessary methods of the unified API.
#[async_trait]
pub trait ShepherdService: Send + Sync {
    async fn version(&self) -> Result<String, Error>;
    async fn object(&self, object_id: &str) -> Result<ShepherdRecord, Error>;
    async fn download_url(&self, object_id: &str) -> Result<String, Error>;
    async fn create_object(&self, object: &NewObject) -> Result<CreatedObject, Error>;
    async fn delete_object(&self, object_id: &str) -> Result<(), Error>;
}

/// Trivial implementation of the ShepherdService trait for the Shepherd client struct
#[async_trait]
impl ShepherdService for Shepherd {
    async fn version(&self) -> Result<String, Error> {
        (self as &Shepherd).version().await
    }

    async fn object(&self, object_id: &str) -> Result<ShepherdRecord, Error> {
        (self as &Shepherd).object(object_id).await
    }

    async fn download_url(&self, object_id: &str) -> Result<String, Error> {
        (self as &Shepherd).download_url(object_id).await
    }

    async fn create_object(&self, object: &NewObject) -> Result<CreatedObject, Error> {
        (self as &Shepherd).create_object(object).await
    }

    async fn delete_object(&self, object_id: &str) -> Result<(), Error> {
        (self as &Shepherd).delete_object(object_id).await
    }
}

/// A wrapper around the necessary methods of the index service.
#[async_trait]
pub trait IndexdService: Send + Sync {
    async fn record(&self, object_id: &str) -> Result<IndexRecord, Error>;
}

/// Trivial implementation of the IndexdService trait for the Indexd client struct
#[async_trait]
impl IndexdService for Indexd {
    async fn record(&self, object_id: &str) -> Result<IndexRecord, Error> {
        (self as &Indexd).record(object_id).await
    }
}

/// A wrapper around the location methods of the broker.  The multipart methods are wrapped
/// separately, by the upload crate.
#[async_trait]
pub trait FenceService: Send + Sync {
    async fn download_url(&self, object_id: &str, protocol: Option<&str>)
        -> Result<String, Error>;
    async fn new_upload(&self, file_name: &str) -> Result<CreatedObject, Error>;
    async fn upload_url(&self, object_id: &str, file_name: &str) -> Result<String, Error>;
    async fn delete(&self, object_id: &str) -> Result<(), Error>;
}

/// Trivial implementation of the FenceService trait for the Fence client struct
#[async_trait]
impl FenceService for Fence {
    async fn download_url(
        &self,
        object_id: &str,
        protocol: Option<&str>,
    ) -> Result<String, Error> {
        (self as &Fence).download_url(object_id, protocol).await
    }

    async fn new_upload(&self, file_name: &str) -> Result<CreatedObject, Error> {
        (self as &Fence).new_upload(file_name).await
    }

    async fn upload_url(&self, object_id: &str, file_name: &str) -> Result<String, Error> {
        (self as &Fence).upload_url(object_id, file_name).await
    }

    async fn delete(&self, object_id: &str) -> Result<(), Error> {
        (self as &Fence).delete(object_id).await
    }
}
