use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::{HttpRequest, HttpResponse, RequestChannel, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain HTTP channel. Keeps a cookie jar so the session cookie set by the
/// server on the init request follows every later request.
#[derive(Clone, Debug)]
pub struct HttpChannel {
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .cookie_store(true)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl RequestChannel for HttpChannel {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tracing::trace!(
            target: "uplink::transport::http",
            uri = %request.uri,
            bytes = request.body.len(),
            "POST"
        );
        let response = self
            .client
            .post(request.uri)
            .header(CONTENT_TYPE, request.content_type)
            .body(request.body)
            .send()
            .await
            .map_err(to_transport_error)?;
        read(response).await
    }

    async fn get(&self, uri: Url) -> Result<HttpResponse, TransportError> {
        tracing::trace!(target: "uplink::transport::http", uri = %uri, "GET");
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(to_transport_error)?;
        read(response).await
    }
}

async fn read(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(to_transport_error)?;
    Ok(HttpResponse { status, body })
}

fn to_transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Network(err.to_string())
    } else {
        TransportError::Http(err)
    }
}
