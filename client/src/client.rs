use crate::error::Error as CommonsError;
use crate::profile::{AuthMode, Profile};
use crate::retry::Backoff;
use crate::signer::sign_request;
use crate::util::err_status_code;
use crate::{Credentials, Retry};
use anyhow::{anyhow, bail, Context, Error, Result};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Path, relative to the endpoint, at which bearer tokens are minted.
const ACCESS_TOKEN_PATH: &str = "user/credentials/api/access_token";

/// A callback invoked with each newly minted access token, typically to write it back to the
/// profile store.
#[derive(Clone)]
pub struct TokenRefreshHook(Arc<dyn Fn(&str) -> Result<()> + Send + Sync>);

impl TokenRefreshHook {
    pub fn new(f: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for TokenRefreshHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenRefreshHook")
    }
}

/// ClientBuilder implements the builder pattern for building a Client, allowing
/// optional configuration of features such as authentication and retry.
#[derive(Default, Debug, Clone)]
pub struct ClientBuilder {
    endpoint: String,
    retry: Retry,
    credentials: Option<Credentials>,
    auth_mode: AuthMode,
    service: String,
    path_prefix: Option<String>,
    timeout: Duration,
    on_token_refresh: Option<TokenRefreshHook>,
}

impl ClientBuilder {
    /// Create a new ClientBuilder.  The commons endpoint URL is required and so must always be
    /// specified.
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            service: "fence".to_owned(),
            ..Self::default()
        }
    }

    /// Start from a profile: its endpoint, credentials and authentication mode.
    pub fn from_profile(profile: &Profile) -> Self {
        Self::new(profile.api_endpoint.clone())
            .credentials(profile.credentials())
            .auth_mode(profile.auth_mode)
    }

    /// Add credentials to the client
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Choose between bearer tokens and HMAC-signed requests.  The default is bearer tokens.
    pub fn auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    /// Set the retry configuration for the client
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeout for each HTTP request made by the client.  The default is
    /// 30 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a callback for newly minted access tokens.
    pub fn on_token_refresh(mut self, hook: TokenRefreshHook) -> Self {
        self.on_token_refresh = Some(hook);
        self
    }

    /// Set the path_prefix; this will be included between the endpoint and the path given to
    /// `request` and `make_url`.  This is used when building a client that will address a
    /// single backend, such as `index/`.  The path prefix must not start with `/` and must end
    /// with a `/` character.
    pub(crate) fn path_prefix<S: Into<String>>(mut self, path_prefix: S) -> Self {
        let path_prefix = path_prefix.into();
        debug_assert!(path_prefix.ends_with('/'));
        self.path_prefix = Some(path_prefix);
        self
    }

    /// Set the service label used in the credential scope of signed requests.
    pub(crate) fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = service.into();
        self
    }

    /// Build the resulting client, consuming the builder
    pub fn build(self) -> Result<Client> {
        Client::new(self)
    }
}

impl From<String> for ClientBuilder {
    fn from(endpoint: String) -> Self {
        Self::new(endpoint)
    }
}

impl From<&str> for ClientBuilder {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint)
    }
}

impl From<&Profile> for ClientBuilder {
    fn from(profile: &Profile) -> Self {
        Self::from_profile(profile)
    }
}

/// Client is the entry point into all the functionality in this package. It
/// contains authentication credentials, and a service endpoint, which are
/// required for all HTTP operations.
///
/// Clones share the current access token, so a token minted through one backend's client is
/// used by all of them.
#[derive(Clone)]
pub struct Client {
    /// The credentials associated with this client and used for requests.
    /// If None, then unauthenticated requests are made.
    credentials: Option<Credentials>,

    auth_mode: AuthMode,

    /// Service label for signed requests
    service: String,

    /// The endpoint used to configure this client
    endpoint: reqwest::Url,

    /// Retry information.
    retry: Retry,

    /// The base URL for requests to the selected backend
    base_url: reqwest::Url,

    /// Most recent bearer token
    access_token: Arc<RwLock<Option<String>>>,

    on_token_refresh: Option<TokenRefreshHook>,

    /// Reqwest client
    client: reqwest::Client,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_str())
            .field("auth_mode", &self.auth_mode)
            .field("service", &self.service)
            .finish()
    }
}

impl Client {
    /// Create a new client (public interface is via
    /// [`ClientBuilder::build`](crate::ClientBuilder::build))
    fn new(b: ClientBuilder) -> Result<Client> {
        let endpoint = crate::profile::validate_endpoint(&b.endpoint)?;
        // joining below replaces the last path segment unless the endpoint ends in `/`
        let endpoint = if endpoint.path().ends_with('/') {
            endpoint
        } else {
            reqwest::Url::parse(&format!("{}/", endpoint))?
        };

        let mut base_url = endpoint.clone();
        if let Some(path_prefix) = b.path_prefix {
            base_url = base_url.join(path_prefix.as_ref()).context(format!(
                "while adding path_prefix to endpoint {}",
                b.endpoint
            ))?;
        }

        // build a reqwest client with the timeout configuration; this will also handle
        // connection re-use.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(b.timeout)
            .build()?;

        let access_token = b.credentials.as_ref().and_then(|c| c.access_token.clone());

        Ok(Client {
            credentials: b.credentials,
            auth_mode: b.auth_mode,
            service: b.service,
            endpoint,
            retry: b.retry,
            base_url,
            access_token: Arc::new(RwLock::new(access_token)),
            on_token_refresh: b.on_token_refresh,
            client,
        })
    }

    /// A client for one backend of the same commons, sharing this client's connection pool and
    /// access token.
    pub(crate) fn for_backend(&self, path_prefix: &str, service: &str) -> Result<Client> {
        debug_assert!(path_prefix.ends_with('/'));
        let mut client = self.clone();
        client.base_url = self.endpoint.join(path_prefix)?;
        client.service = service.to_owned();
        Ok(client)
    }

    /// Make a request to the commons.  While the per-backend types are generally more convenient,
    /// this method can be used to call a path on the commons directly.
    ///
    /// The request URI is `<endpoint>/<path_prefix>/<path>`.  The `path` parameter must not start
    /// with `/`.
    ///
    /// This will automatically retry on server-side errors and return an error for client errors.
    /// Success and redirection responses are treated as OK.  In bearer mode, a 401 response causes
    /// a new access token to be minted and the request to be tried once more; a second 401 is an
    /// authentication error.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        query: Option<Vec<(&str, &str)>>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, Error> {
        if self.can_refresh() && self.access_token.read().await.is_none() {
            self.refresh_access_token().await?;
        }

        let req = self.build_request(method, path, query.clone(), body).await?;
        match self.send(req).await {
            Err(err) if is_unauthorized(&err) && self.can_refresh() => {
                debug!("{} {} was unauthorized; minting a new access token", method, path);
                self.refresh_access_token().await?;
                let req = self.build_request(method, path, query, body).await?;
                self.send(req).await.map_err(|err| {
                    if is_unauthorized(&err) {
                        err.context(CommonsError::Auth(format!(
                            "{} {} rejected a freshly minted access token",
                            method, path
                        )))
                    } else {
                        err
                    }
                })
            }
            Err(err) if is_unauthorized(&err) => Err(err.context(CommonsError::Auth(format!(
                "{} {} was unauthorized",
                method, path
            )))),
            res => res,
        }
    }

    /// Send a request, retrying on server errors and connection failures.
    async fn send(&self, req: reqwest::Request) -> Result<reqwest::Response, Error> {
        let mut backoff = Backoff::new(&self.retry);
        let url = req.url().as_str().to_owned();

        loop {
            let req = req
                .try_clone()
                .ok_or_else(|| anyhow!("Cannot clone the request {}", url))?;

            let retry_for;
            match self.client.execute(req).await {
                // From the request docs for Client::execute:
                // > This method fails if there was an error while sending request, redirect loop
                // > was detected or redirect limit was exhausted.
                // All cases where there's a successful HTTP response are Ok(..).
                Err(e) => {
                    retry_for = Error::from(e);
                }

                // Retry for server errors
                Ok(resp) if resp.status().is_server_error() => {
                    retry_for = match resp.error_for_status() {
                        Err(e) => e.into(),
                        Ok(resp) => anyhow!("server error {} from {}", resp.status(), url),
                    };
                }

                // client errors do not get retried
                Ok(resp) if resp.status().is_client_error() => {
                    let err = match resp.error_for_status_ref() {
                        Err(e) => e,
                        Ok(_) => bail!("client error {} from {}", resp.status(), url),
                    };

                    // try to add context based on the message from the JSON body, falling back
                    // to just returning the reqwest::Error
                    if let Ok(json) = resp.json::<Value>().await {
                        let message = json
                            .get("message")
                            .or_else(|| json.get("error"))
                            .and_then(|m| m.as_str());
                        if let Some(s) = message {
                            return Err(Error::from(err).context(s.to_owned()));
                        }
                    }
                    return Err(err.into());
                }

                Ok(resp) => {
                    return Ok(resp);
                }
            };

            // if we got here, we are going to retry, or return the error if we are done
            // retrying.
            match backoff.next_backoff() {
                Some(duration) => {
                    debug!("retrying {} in {:?}: {:#}", url, duration, retry_for);
                    tokio::time::sleep(duration).await
                }
                None => return Err(retry_for),
            }
        }
    }

    fn can_refresh(&self) -> bool {
        self.auth_mode == AuthMode::Bearer && self.credentials.is_some()
    }

    /// Mint a new bearer token from the long-lived API key, store it for later requests, and
    /// pass it to the refresh hook, if any.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| CommonsError::Auth("no credentials to mint a token from".to_owned()))?;

        let url = self.endpoint.join(ACCESS_TOKEN_PATH)?;
        let req = self
            .client
            .post(url)
            .json(&json!({"api_key": creds.api_key, "key_id": creds.key_id}))
            .build()?;

        let resp = self.send(req).await.map_err(|err| {
            match err_status_code(&err) {
                Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => err.context(
                    CommonsError::Auth(format!("API key {} was rejected", creds.key_id)),
                ),
                _ => err,
            }
        })?;

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let token = resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| CommonsError::Auth(format!("unexpected access token response: {}", e)))?
            .access_token;

        *self.access_token.write().await = Some(token.clone());
        if let Some(hook) = &self.on_token_refresh {
            if let Err(e) = (hook.0)(&token) {
                warn!("could not save refreshed access token: {:#}", e);
            }
        }
        Ok(token)
    }

    /// Get the endpoint with which this client was configured
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    async fn build_request(
        &self,
        method: &str,
        path: &str,
        query: Option<Vec<(&str, &str)>>,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, Error> {
        let url = self.join_url(path, query)?;

        let meth = reqwest::Method::from_str(method)?;

        let mut req = self.client.request(meth, url);

        // pass content-length: 0 if there is no body.  This is implicit for GET requests,
        // but not for methods that typically have a body.
        if body.is_none() {
            req = req.header("Content-Length", "0");
        }

        let req = match body {
            Some(b) => req.json(&b),
            None => req,
        };

        let mut req = req.build()?;

        match (&self.credentials, self.auth_mode) {
            (None, _) => {}
            (Some(creds), AuthMode::Hmac) => {
                sign_request(
                    &mut req,
                    &creds.key_id,
                    &creds.api_key,
                    &self.service,
                    Utc::now(),
                )?;
            }
            (Some(_), AuthMode::Bearer) => {
                if let Some(token) = self.access_token.read().await.as_deref() {
                    let value = HeaderValue::from_str(&format!("Bearer {}", token))
                        .context("access token is not a valid header value")?;
                    req.headers_mut().insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }
        Ok(req)
    }

    fn join_url(&self, path: &str, query: Option<Vec<(&str, &str)>>) -> Result<reqwest::Url> {
        if path.starts_with('/') {
            bail!("Request path must not begin with `/`");
        }

        let mut url = self.base_url.join(path)?;

        if let Some(q) = query {
            url.query_pairs_mut().extend_pairs(q);
        }
        Ok(url)
    }

    /// Make a URL for the given path, constructed as for [`request`](crate::Client::request).  The
    /// path should not begin with a `/`.
    pub fn make_url(&self, path: &str, query: Option<Vec<(&str, &str)>>) -> Result<String> {
        Ok(self.join_url(path, query)?.as_ref().to_owned())
    }
}

fn is_unauthorized(err: &Error) -> bool {
    err_status_code(err) == Some(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::signer::verify_parts;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio;

    /// An httptest matcher that will check HMAC request signatures with the given credentials.
    pub fn signed_with(creds: Credentials, service: &str, addr: SocketAddr) -> SignedWith {
        SignedWith(creds, service.to_owned(), addr)
    }

    #[derive(Debug)]
    pub struct SignedWith(Credentials, String, SocketAddr);

    impl<B: AsRef<[u8]>> Matcher<httptest::http::Request<B>> for SignedWith {
        fn matches(
            &mut self,
            input: &httptest::http::Request<B>,
            _ctx: &mut ExecutionContext,
        ) -> bool {
            let url = reqwest::Url::parse(&format!("http://{}{}", self.2, input.uri())).unwrap();
            let headers = input
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap().to_owned()))
                .collect::<Vec<_>>();
            match verify_parts(
                &self.1,
                input.method().as_str(),
                &url,
                &headers,
                input.body().as_ref(),
                &self.0.api_key,
                Utc::now(),
            ) {
                Ok(true) => true,
                res => {
                    println!("signature check failed: {:?}", res);
                    false
                }
            }
        }

        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            <Self as fmt::Debug>::fmt(self, f)
        }
    }

    fn retry_fast() -> Retry {
        Retry {
            retries: 6,
            max_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_simple_request() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/index/_status"))
                .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint).path_prefix("index/").build()?;
        let resp = client.request("GET", "_status", None, None).await?;
        assert!(resp.status().is_success());
        Ok(())
    }

    #[test]
    fn test_bad_endpoint() {
        let err = ClientBuilder::new("not a url").build().unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_timeout() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/index/_status")).respond_with(
                // note that the tests do not wait for this to actually time out,
                // so this is a very long delay to avoid any test intermittency
                delay_and_then(Duration::from_secs(30), status_code(200)),
            ),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .path_prefix("index/")
            .timeout(Duration::from_millis(5))
            .retry(Retry {
                retries: 0,
                ..Default::default()
            })
            .build()?;
        let err = client.request("GET", "_status", None, None).await.unwrap_err();
        let reqerr = err.downcast::<reqwest::Error>().unwrap();
        assert!(reqerr.is_timeout());
        Ok(())
    }

    #[tokio::test]
    async fn test_hmac_signed_request() -> Result<(), Error> {
        let creds = Credentials::new("AKID", "secret-key");

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/user/data/upload"),
                signed_with(creds.clone(), "fence", server.addr()),
            ])
            .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .path_prefix("user/")
            .credentials(creds)
            .auth_mode(AuthMode::Hmac)
            .build()?;
        let resp = client
            .request(
                "POST",
                "data/upload",
                None,
                Some(&json!({"file_name": "a.txt"})),
            )
            .await?;
        assert!(resp.status().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_hmac_uses_backend_service_label() -> Result<(), Error> {
        let creds = Credentials::new("AKID", "secret-key");

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/index/index/dg.1234/abc"),
                signed_with(creds.clone(), "indexd", server.addr()),
            ])
            .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .credentials(creds)
            .auth_mode(AuthMode::Hmac)
            .build()?
            .for_backend("index/", "indexd")?;
        let resp = client.request("GET", "index/dg.1234/abc", None, None).await?;
        assert!(resp.status().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_bearer_mints_token_first() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/user/credentials/api/access_token"),
                request::body(json_decoded(eq(json!({"api_key": "ak", "key_id": "kid"})))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({"access_token": "tok-1"}))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/mds/version"),
                request::headers(contains(("authorization", "Bearer tok-1"))),
            ])
            .times(2)
            .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .credentials(Credentials::new("kid", "ak"))
            .build()?;
        client.request("GET", "mds/version", None, None).await?;
        // the token is cached for the second request
        client.request("GET", "mds/version", None, None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_401_refreshes_token_once() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/user/data/download/abc"),
                request::headers(contains(("authorization", "Bearer stale"))),
            ])
            .times(1)
            .respond_with(status_code(401)),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/user/credentials/api/access_token",
            ))
            .times(1)
            .respond_with(json_encoded(json!({"access_token": "fresh"}))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/user/data/download/abc"),
                request::headers(contains(("authorization", "Bearer fresh"))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({"url": "https://storage/abc"}))),
        );
        let endpoint = format!("http://{}", server.addr());

        let saved = Arc::new(Mutex::new(Vec::<String>::new()));
        let saved2 = saved.clone();
        let client = ClientBuilder::new(&endpoint)
            .credentials(Credentials::new("kid", "ak").with_access_token("stale"))
            .on_token_refresh(TokenRefreshHook::new(move |tok| {
                saved2.lock().unwrap().push(tok.to_owned());
                Ok(())
            }))
            .retry(retry_fast())
            .build()?;
        let resp = client
            .request("GET", "user/data/download/abc", None, None)
            .await?;
        assert_eq!(
            resp.json::<Value>().await?,
            json!({"url": "https://storage/abc"})
        );
        assert_eq!(*saved.lock().unwrap(), vec!["fresh".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_401_is_auth_error() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/user/data/download/abc"))
                .times(2)
                .respond_with(status_code(401)),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/user/credentials/api/access_token",
            ))
            .times(1)
            .respond_with(json_encoded(json!({"access_token": "fresh"}))),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .credentials(Credentials::new("kid", "ak").with_access_token("stale"))
            .retry(retry_fast())
            .build()?;
        let err = client
            .request("GET", "user/data/download/abc", None, None)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Auth);
        assert_eq!(err_status_code(&err), Some(StatusCode::UNAUTHORIZED));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_api_key_is_auth_error() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/user/credentials/api/access_token",
            ))
            .times(1)
            .respond_with(status_code(403)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint)
            .credentials(Credentials::new("kid", "ak"))
            .build()?;
        let err = client.request("GET", "mds/version", None, None).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Auth);
        Ok(())
    }

    #[tokio::test]
    async fn test_query() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/user/data/upload/abc"),
                request::query(url_decoded(contains(("file_name", "a b.txt")))),
            ])
            .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint).path_prefix("user/").build()?;
        let resp = client
            .request(
                "GET",
                "data/upload/abc",
                Some(vec![("file_name", "a b.txt")]),
                None,
            )
            .await?;
        assert!(resp.status().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_body() -> Result<(), Error> {
        let body = json!({"hello": "world"});

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/mds/objects"),
                request::body(json_decoded(eq(body.clone()))),
            ])
            .respond_with(status_code(200)),
        );
        let endpoint = format!("http://{}", server.addr());

        let client = ClientBuilder::new(&endpoint).path_prefix("mds/").build()?;
        let resp = client.request("POST", "objects", None, Some(&body)).await?;
        assert!(resp.status().is_success());
        Ok(())
    }

    #[test]
    fn make_url_simple() -> Result<(), Error> {
        let client = ClientBuilder::new("https://commons.example.org")
            .path_prefix("index/")
            .build()?;
        let url = client.make_url("index/abc", None)?;
        assert_eq!(url, "https://commons.example.org/index/index/abc");
        Ok(())
    }

    #[test]
    fn make_url_endpoint_with_path() -> Result<(), Error> {
        let client = ClientBuilder::new("https://commons.example.org/base")
            .path_prefix("index/")
            .build()?;
        let url = client.make_url("index/abc", None)?;
        assert_eq!(url, "https://commons.example.org/base/index/index/abc");
        Ok(())
    }

    #[test]
    fn make_url_query() -> Result<(), Error> {
        let client = ClientBuilder::new("https://commons.example.org")
            .path_prefix("user/")
            .build()?;
        let url = client.make_url("data/download/a", Some(vec![("protocol", "s3"), ("x!z", "1/3")]))?;
        assert_eq!(
            url,
            "https://commons.example.org/user/data/download/a?protocol=s3&x%21z=1%2F3"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_500_retry() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/mds/version"))
                .times(7) // 1 try, 6 retries
                .respond_with(status_code(500)),
        );
        let endpoint = format!("http://{}", server.addr());
        let client = ClientBuilder::new(endpoint).retry(retry_fast()).build()?;

        let result = client.request("GET", "mds/version", None, None).await;
        assert!(result.is_err());
        let reqw_err: reqwest::Error = result.err().unwrap().downcast()?;
        assert_eq!(reqw_err.status().unwrap(), 500);
        Ok(())
    }

    #[tokio::test]
    async fn test_400_no_retry() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/mds/version"))
                .times(1)
                .respond_with(
                    status_code(400).body(r#"{"message": "no such thing"}"#),
                ),
        );
        let endpoint = format!("http://{}", server.addr());
        let client = ClientBuilder::new(endpoint).retry(retry_fast()).build()?;

        let result = client.request("GET", "mds/version", None, None).await;
        let err = result.unwrap_err();
        assert_eq!(err_status_code(&err), Some(reqwest::StatusCode::BAD_REQUEST));
        assert_eq!(err.to_string(), "no such thing");
        Ok(())
    }

    #[tokio::test]
    async fn test_303_no_follow() -> Result<(), Error> {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/user/data/download/a"))
                .times(1)
                // should not follow this redirect..
                .respond_with(
                    status_code(303)
                        .insert_header("location", "http://storage.example.org/a")
                        .insert_header("content-type", "application/json")
                        .body("{\"url\":\"http://storage.example.org/a\"}"),
                ),
        );
        let endpoint = format!("http://{}", server.addr());
        let client = ClientBuilder::new(endpoint).retry(retry_fast()).build()?;

        let resp = client
            .request("GET", "user/data/download/a", None, None)
            .await?;
        assert_eq!(resp.status(), 303);
        assert_eq!(
            resp.json::<serde_json::Value>().await?,
            json!({"url": "http://storage.example.org/a"})
        );
        Ok(())
    }
}
