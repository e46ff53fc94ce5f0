//! The network side of the proxy.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::http::{Header, Request, Response};

/// Something that can perform a live fetch.
///
/// A rejected future means the request never produced a response
/// (offline, DNS failure, timeout, abort). HTTP error statuses are
/// resolved responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

/// `reqwest`-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone())
        .headers(header_map(&request.headers)?);
      if let Some(body) = request.body.clone() {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let url = response.url().clone();
      let status = response.status().as_u16();
      let headers = headers_from(response.headers());

      // Drain the body now so the response can be duplicated later
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?
        .to_vec();

      Ok(Response::new(url, status, headers, body))
    })
  }
}

/// Request headers in the form reqwest sends them.
fn header_map(headers: &[Header]) -> Result<HeaderMap> {
  let mut map = HeaderMap::new();
  for header in headers {
    let name = HeaderName::from_bytes(header.name.as_bytes())
      .map_err(|e| eyre!("Invalid header name '{}': {}", header.name, e))?;
    let value = HeaderValue::from_bytes(&header.value)
      .map_err(|e| eyre!("Invalid value for header '{}': {}", header.name, e))?;
    map.append(name, value);
  }
  Ok(map)
}

/// Response headers with their values kept byte for byte.
fn headers_from(map: &HeaderMap) -> Vec<Header> {
  map
    .iter()
    .map(|(name, value)| Header::new(name.as_str(), value.as_bytes()))
    .collect()
}
