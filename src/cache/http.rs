//! Request/response model seen by the cache, and the reqwest-backed fetcher.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use super::traits::Fetcher;

/// What the request will be used for, as declared by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Empty,
  Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  SameOrigin,
  NoCors,
  #[default]
  Cors,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "" | "empty" => Ok(Self::Empty),
      "other" => Ok(Self::Other),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

impl FromStr for RequestMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "navigate" => Ok(Self::Navigate),
      "same-origin" => Ok(Self::SameOrigin),
      "no-cors" => Ok(Self::NoCors),
      "cors" => Ok(Self::Cors),
      other => Err(format!("unknown request mode '{}'", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation (GET, document destination, navigate mode).
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Document,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Stable storage key: SHA-256 of method and URL, fragment ignored.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// 2xx status
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Fetches over the real network with reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();
    Box::pin(async move {
      let url = request.url.to_string();
      let response = client
        .request(request.method.clone(), request.url)
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

      let status = response.status().as_u16();
      let final_url = response.url().to_string();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

      Ok(Response {
        url: final_url,
        status,
        headers,
        body: body.to_vec(),
      })
    })
  }
}
