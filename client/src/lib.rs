/*!
# Data Commons Client

This crate is a wrapper around `reqwest` for talking to a data commons: the unified
metadata/storage API, the legacy index service, and the auth/download broker.  It adds
authentication, retries, and a uniform way to find out where an object's bytes live.

The sibling crates `commons-upload`, `commons-download` and `commons-batch` build the actual
transfers on top of this one.

# Usage

## Setup

Requests go through a [`Client`](crate::Client), built with a
[`ClientBuilder`](crate::ClientBuilder).  At minimum the builder needs the commons endpoint.
Most callers start from a [`Profile`](crate::Profile) instead:

```
# use commons::{ClientBuilder, Credentials, Profile};
# fn main() -> anyhow::Result<()> {
let profile = Profile::new(
    "default",
    Credentials::new("my_key_id", "my_api_key"),
    "https://commons.example.org",
);
profile.validate()?;
let client = ClientBuilder::from_profile(&profile).build()?;
assert_eq!(client.endpoint(), "https://commons.example.org/");
# Ok(())
# }
```

## Authentication

A profile authenticates in one of two ways, chosen by [`AuthMode`](crate::AuthMode):

* `Bearer` (the default): a short-lived access token is minted from the API key, sent as a
  bearer token, and minted again when the commons answers 401.  Register a
  [`TokenRefreshHook`](crate::TokenRefreshHook) to save new tokens back to the profile store.
* `Hmac`: each request is signed with the key pair, using the scheme in [`signer`].

## Error Handling

All 5xx (server error) responses are automatically retried, following the client's
[`Retry`](crate::Retry) configuration.  All 4xx (client error) responses are converted to
`Result::Err`.  Redirects are not followed.

Functions return `anyhow::Error`.  Errors that matter to callers carry an
[`Error`](crate::Error) somewhere in their chain; classify any error with
[`error_kind`](crate::error_kind).  For the HTTP status of a failed request, use
[`err_status_code`](crate::err_status_code).  The `reqwest::StatusCode` type that this returns is
re-exported from this crate.

## Locating Objects

[`Resolver`](crate::Resolver) implements [`Resolve`](crate::Resolve), which turns an object id into
a [`Location`](crate::Location): a presigned URL plus the object's name and size.
*/

mod client;
mod credentials;
mod error;
mod profile;
mod resolver;
pub mod retry;
pub mod services;
pub mod signer;
mod util;

pub use client::{Client, ClientBuilder, TokenRefreshHook};
pub use credentials::Credentials;
pub use error::{error_kind, Error, ErrorKind, ResolutionReason};
pub use profile::{
    validate_endpoint, AuthMode, Profile, ProfileStore, TomlProfileStore,
    DEFAULT_MIN_SHEPHERD_VERSION,
};
pub use resolver::{Location, Resolve, Resolver, Want};
pub use retry::{Backoff, Retry};
pub use util::err_status_code;

/// Re-exported from `chrono`, for timestamps in ledgers and signatures
pub use chrono;

/// Re-exported from `reqwest`, for use with [`err_status_code`]
pub use reqwest::StatusCode;
