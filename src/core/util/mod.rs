use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http::{header, Request, Response};
use serde::de::DeserializeOwned;
use url::Url;

/// Generic HTTP client.
///
/// A trait is used here so to facilitate native HTTP/TLS when compiled for mobile applications.
#[async_trait]
pub trait AsyncHttpClient: Send + Sync {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

/// Fetches `url` and deserializes the JSON body.
///
/// Used for relying party metadata referenced by URL, such as `jwks_uri`.
pub async fn get_json<T: DeserializeOwned>(
    client: &dyn AsyncHttpClient,
    url: &Url,
) -> Result<T> {
    let request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header(header::ACCEPT, "application/json")
        .body(vec![])
        .context("failed to build request")?;

    tracing::debug!(%url, "fetching remote JSON");
    let response = client
        .execute(request)
        .await
        .with_context(|| format!("failed to fetch {url}"))?;

    if !response.status().is_success() {
        bail!("{url} returned status {}", response.status());
    }

    serde_json::from_slice(response.body())
        .with_context(|| format!("response from {url} was not the expected JSON"))
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}
