//! Request and response values passed between the host, the proxy and the network.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// An outgoing request as seen by the interceptor.
///
/// Headers and body travel with the request to the network but are not
/// part of its cache identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<Header>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, header: Header) -> Self {
    self.headers.push(header);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Only plain reads are eligible for caching.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }
}

/// A single header, kept in wire order.
///
/// Values are raw bytes: header values are not guaranteed to be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
  pub name: String,
  pub value: Vec<u8>,
}

impl Header {
  pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }

  /// The value as text, if it is valid UTF-8.
  pub fn value_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.value).ok()
  }
}

/// A fully buffered response.
///
/// Bodies off the wire can only be read once. The network layer drains
/// the body into memory before handing the response over, so a `Clone`
/// gives an independent copy that can go to storage while the original
/// goes back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub headers: Vec<Header>,
  body: Vec<u8>,
}

impl Response {
  pub fn new(url: Url, status: u16, headers: Vec<Header>, body: Vec<u8>) -> Self {
    Self {
      url,
      status,
      headers,
      body,
    }
  }

  /// True for 2xx statuses.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  /// First header with this name, if its value is text.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|h| h.name.eq_ignore_ascii_case(name))
      .and_then(Header::value_str)
  }
}
