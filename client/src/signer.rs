//! HMAC request signing, a variant of the cloud-provider "signature v4" scheme that the commons
//! verifies.
//!
//! Signing happens in three independently testable steps:
//!
//! 1. [`canonical_request`] renders the method, path, query, signed headers and body hash into a
//!    deterministic string, which is then SHA-256 hashed;
//! 2. [`string_to_sign`] combines that hash with the timestamp and credential scope;
//! 3. [`derive_signing_key`] and [`signature`] run the HMAC chain over the string to sign.
//!
//! [`sign_request`] applies all three to a `reqwest::Request` and adds the `Authorization` header;
//! [`verify_request`] and [`verify_parts`] check a signed request against a shared secret.
use crate::error::Error as CommonsError;
use crate::util::urlencode;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, HOST};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "HMAC4-SHA256";
pub const DATE_HEADER: &str = "x-amz-date";
pub const CONTENT_HASH_HEADER: &str = "x-amz-content-sha256";

const SECRET_PREFIX: &str = "HMAC4";
const REQUEST_TYPE: &str = "hmac4_request";
const PROVIDER_HEADER_PREFIX: &str = "x-amz-";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DATE_FORMAT: &str = "%Y%m%d";

/// Signed requests older (or newer) than this are rejected outright.
pub const VALIDITY_WINDOW_SECS: i64 = 15 * 60;

/// Reasons a signed request is rejected before its signature is even compared.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("request timestamp {0} is outside the validity window")]
    Expired(String),
    #[error("malformed signed request: {0}")]
    Malformed(String),
}

/// Scratch state for one signing operation.
#[derive(Debug)]
struct SigningMetadata {
    algorithm: &'static str,
    timestamp: String,
    date: String,
    credential_scope: String,
    signed_headers: String,
}

impl SigningMetadata {
    fn new(now: &DateTime<Utc>, service: &str, signed_headers: String) -> Self {
        let date = now.format(DATE_FORMAT).to_string();
        SigningMetadata {
            algorithm: ALGORITHM,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            credential_scope: credential_scope(&date, service),
            date,
            signed_headers,
        }
    }
}

/// The canonical form of a request, along with the header names it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub text: String,
    pub signed_headers: String,
}

impl CanonicalRequest {
    /// Hex-encoded SHA-256 of the canonical text.
    pub fn hash(&self) -> String {
        hash_hex(self.text.as_bytes())
    }
}

pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn credential_scope(date: &str, service: &str) -> String {
    format!("{}/{}/{}", date, service, REQUEST_TYPE)
}

fn is_signable(name: &str) -> bool {
    name == "content-type"
        || name == "content-md5"
        || name == "host"
        || name.starts_with(PROVIDER_HEADER_PREFIX)
}

fn strip_default_port(host: &str) -> &str {
    host.strip_suffix(":80")
        .or_else(|| host.strip_suffix(":443"))
        .unwrap_or(host)
}

/// Host as it would appear in a `Host` header for this URL.
fn url_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL {} has no host", url))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_owned(),
    })
}

/// Select the headers that take part in signing: lowercased, trimmed, with the default port
/// removed from `host`.  Repeated headers are joined with `,`.
pub fn signable_headers<'a>(
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    let mut selected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_lowercase();
        if !is_signable(&name) {
            continue;
        }
        let value = if name == "host" {
            strip_default_port(value.trim())
        } else {
            value.trim()
        };
        selected
            .entry(name)
            .and_modify(|v| {
                v.push(',');
                v.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    selected
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_owned();
    }
    path.split('/')
        .map(|segment| urlencode(&percent_decode_str(segment).decode_utf8_lossy()).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

// `urlencode` leaves only unreserved characters bare, so a space is always `%20` and a literal
// `+` is always `%2B`.
fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(k, v)| (urlencode(&k).to_string(), urlencode(&v).to_string()))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the canonical request from already-selected headers (see [`signable_headers`]).
pub fn canonical_request(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    body_hash: &str,
) -> CanonicalRequest {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(&format!("{}:{}\n", name, value));
    }
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let text = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.to_uppercase(),
        canonical_uri(url),
        canonical_query(url),
        canonical_headers,
        signed_headers,
        body_hash
    );
    CanonicalRequest {
        text,
        signed_headers,
    }
}

pub fn string_to_sign(timestamp: &str, credential_scope: &str, canonical_hash: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM, timestamp, credential_scope, canonical_hash
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn derive_signing_key(secret: &str, date: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("{}{}", SECRET_PREFIX, secret).as_bytes(),
        date.as_bytes(),
    );
    let k_service = hmac_sha256(&k_date, service.as_bytes());
    hmac_sha256(&k_service, REQUEST_TYPE.as_bytes())
}

pub fn signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

fn compute_authorization(
    method: &str,
    url: &Url,
    headers: &BTreeMap<String, String>,
    body_hash: &str,
    key_id: &str,
    secret: &str,
    service: &str,
    now: &DateTime<Utc>,
) -> (SigningMetadata, String, String) {
    let canonical = canonical_request(method, url, headers, body_hash);
    let meta = SigningMetadata::new(now, service, canonical.signed_headers.clone());
    let sts = string_to_sign(&meta.timestamp, &meta.credential_scope, &canonical.hash());
    let sig = signature(&derive_signing_key(secret, &meta.date, service), &sts);
    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        meta.algorithm, key_id, meta.credential_scope, meta.signed_headers, sig
    );
    (meta, sig, authorization)
}

/// Sign a request in place: set the content-hash, date and host headers, then the
/// `Authorization` header.  Streaming bodies cannot be signed, since the body must be hashed
/// before it is sent.
///
/// A request that cannot be signed never will be, so failures are
/// [`Error::Protocol`](crate::Error::Protocol).
pub fn sign_request(
    req: &mut reqwest::Request,
    key_id: &str,
    secret: &str,
    service: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    apply_signature(req, key_id, secret, service, now).map_err(|e| {
        CommonsError::Protocol(format!("cannot sign {} {}: {:#}", req.method(), req.url(), e))
            .into()
    })
}

fn apply_signature(
    req: &mut reqwest::Request,
    key_id: &str,
    secret: &str,
    service: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let body_hash = match req.body() {
        Some(body) => hash_hex(
            body.as_bytes()
                .ok_or_else(|| anyhow!("stream request bodies are not supported"))?,
        ),
        None => hash_hex(b""),
    };

    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
    let host = url_host(req.url())?;
    let headers = req.headers_mut();
    headers.insert(
        HeaderName::from_static(CONTENT_HASH_HEADER),
        HeaderValue::from_str(&body_hash)?,
    );
    headers.insert(
        HeaderName::from_static(DATE_HEADER),
        HeaderValue::from_str(&timestamp)?,
    );
    if !headers.contains_key(HOST) {
        headers.insert(HOST, HeaderValue::from_str(&host).context(host.clone())?);
    }

    let selected = signable_headers(header_pairs(req.headers())?);
    let (_, _, authorization) = compute_authorization(
        req.method().as_str(),
        req.url(),
        &selected,
        &body_hash,
        key_id,
        secret,
        service,
        &now,
    );
    req.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&authorization).context(authorization.clone())?,
    );
    Ok(())
}

fn header_pairs(headers: &HeaderMap) -> Result<Vec<(&str, &str)>> {
    headers
        .iter()
        .map(|(name, value)| {
            Ok((
                name.as_str(),
                value
                    .to_str()
                    .with_context(|| format!("header {} is not valid text", name))?,
            ))
        })
        .collect()
}

/// The parsed form of an `Authorization` header produced by [`sign_request`].
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedAuthorization {
    pub key_id: String,
    pub credential_scope: String,
    pub signed_headers: Vec<String>,
    pub signature: String,
}

pub fn parse_authorization(header: &str) -> Result<ParsedAuthorization, SignatureError> {
    let rest = header
        .strip_prefix(ALGORITHM)
        .and_then(|r| r.strip_prefix(' '))
        .ok_or_else(|| SignatureError::Malformed(format!("expected {} scheme", ALGORITHM)))?;

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in rest.split(',') {
        let (k, v) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| SignatureError::Malformed(format!("bad component {:?}", part)))?;
        match k {
            "Credential" => credential = Some(v),
            "SignedHeaders" => signed_headers = Some(v),
            "Signature" => signature = Some(v),
            _ => {}
        }
    }

    let missing = |what: &str| SignatureError::Malformed(format!("missing {}", what));
    let (key_id, credential_scope) = credential
        .ok_or_else(|| missing("Credential"))?
        .split_once('/')
        .ok_or_else(|| missing("credential scope"))?;
    Ok(ParsedAuthorization {
        key_id: key_id.to_owned(),
        credential_scope: credential_scope.to_owned(),
        signed_headers: signed_headers
            .ok_or_else(|| missing("SignedHeaders"))?
            .split(';')
            .map(str::to_owned)
            .collect(),
        signature: signature.ok_or_else(|| missing("Signature"))?.to_owned(),
    })
}

fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>, SignatureError> {
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| SignatureError::Malformed(format!("bad timestamp {:?}", timestamp)))
}

/// Verify a signed request given its parts, as a server would see them.  Returns `Ok(false)` on
/// signature mismatch; expiry and malformed requests are errors.
pub fn verify_parts(
    service: &str,
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
) -> Result<bool, SignatureError> {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let auth = parse_authorization(
        find(AUTHORIZATION.as_str())
            .ok_or_else(|| SignatureError::Malformed("no Authorization header".to_owned()))?,
    )?;
    let timestamp = find(DATE_HEADER)
        .ok_or_else(|| SignatureError::Malformed(format!("no {} header", DATE_HEADER)))?;
    let signed_at = parse_timestamp(timestamp)?;
    if (now - signed_at).num_seconds().abs() > VALIDITY_WINDOW_SECS {
        return Err(SignatureError::Expired(timestamp.to_owned()));
    }

    // only the headers the signer chose are reconstructed
    let mut selected = BTreeMap::new();
    for name in &auth.signed_headers {
        let value = find(name).ok_or_else(|| {
            SignatureError::Malformed(format!("signed header {} is missing", name))
        })?;
        let value = if name == "host" {
            strip_default_port(value.trim())
        } else {
            value.trim()
        };
        selected.insert(name.clone(), value.to_owned());
    }

    let (meta, sig, _) = compute_authorization(
        method,
        url,
        &selected,
        &hash_hex(body),
        &auth.key_id,
        secret,
        service,
        &signed_at,
    );
    Ok(meta.credential_scope == auth.credential_scope && sig == auth.signature)
}

/// Verify a `reqwest::Request` signed by [`sign_request`].
pub fn verify_request(
    service: &str,
    req: &reqwest::Request,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<bool, SignatureError> {
    let body = match req.body() {
        Some(body) => body
            .as_bytes()
            .ok_or_else(|| SignatureError::Malformed("streaming body".to_owned()))?,
        None => &[],
    };
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| {
            v.to_str()
                .map(|v| (k.as_str().to_owned(), v.to_owned()))
                .map_err(|_| SignatureError::Malformed(format!("header {} is not text", k)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    verify_parts(
        service,
        req.method().as_str(),
        req.url(),
        &headers,
        body,
        secret,
        now,
    )
}
