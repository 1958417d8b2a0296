//! Which strategy handles an intercepted request.

use reqwest::Method;
use url::Url;

use crate::cache::{Destination, Request};
use crate::config::CacheConfig;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "avif", "ico"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

/// Routing inputs taken from the cache config
#[derive(Debug, Clone)]
pub struct RoutingRules {
  pub origin: Url,
  pub api_prefix: String,
  pub backend_hosts: Vec<String>,
}

impl RoutingRules {
  pub fn new(origin: Url, config: &CacheConfig) -> Self {
    Self {
      origin,
      api_prefix: config.api_prefix.clone(),
      backend_hosts: config.backend_hosts.clone(),
    }
  }

  /// Pick a strategy, or `None` to let the request through untouched.
  ///
  /// 1. Non-GET requests pass through
  /// 2. Cross-origin requests pass through unless they target an image file
  /// 3. API paths and backend hosts are network-first
  /// 4. Image destinations are cache-first
  /// 5. Everything else is stale-while-revalidate
  pub fn route(&self, request: &Request) -> Option<Strategy> {
    if request.method != Method::GET {
      return None;
    }

    let same_origin = request.url.origin() == self.origin.origin();
    if !same_origin && !is_image_url(&request.url) {
      return None;
    }

    if self.is_api(&request.url) {
      return Some(Strategy::NetworkFirst);
    }

    if request.destination == Destination::Image {
      return Some(Strategy::CacheFirst);
    }

    Some(Strategy::StaleWhileRevalidate)
  }

  fn is_api(&self, url: &Url) -> bool {
    if !self.api_prefix.is_empty() && url.path().starts_with(&self.api_prefix) {
      return true;
    }
    let host = url.host_str().unwrap_or_default();
    self
      .backend_hosts
      .iter()
      .any(|fragment| !fragment.is_empty() && host.contains(fragment.as_str()))
  }
}

fn is_image_url(url: &Url) -> bool {
  url
    .path()
    .rsplit_once('.')
    .map(|(_, ext)| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rules() -> RoutingRules {
    RoutingRules::new(
      Url::parse("https://habesha.example").unwrap(),
      &CacheConfig::default(),
    )
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_passes_through() {
    let request = Request::new(
      Method::POST,
      Url::parse("https://habesha.example/api/messages").unwrap(),
    );
    assert_eq!(rules().route(&request), None);
  }

  #[test]
  fn test_api_path_is_network_first() {
    assert_eq!(
      rules().route(&get("https://habesha.example/api/listings?q=car")),
      Some(Strategy::NetworkFirst)
    );
  }

  #[test]
  fn test_backend_host_is_network_first() {
    // Cross-origin backend image URLs are allowed through, then matched by host
    assert_eq!(
      rules().route(&get(
        "https://abc.supabase.co/storage/v1/object/public/avatars/me.png"
      )),
      Some(Strategy::NetworkFirst)
    );
  }

  #[test]
  fn test_cross_origin_non_image_passes_through() {
    assert_eq!(rules().route(&get("https://abc.supabase.co/rest/v1/listings")), None);
    assert_eq!(rules().route(&get("https://cdn.example/app.js")), None);
  }

  #[test]
  fn test_cross_origin_image_is_cached() {
    let request =
      get("https://images.cdn.example/photos/Church.JPG").with_destination(Destination::Image);
    assert_eq!(rules().route(&request), Some(Strategy::CacheFirst));

    // Image extension but declared as something else
    assert_eq!(
      rules().route(&get("https://images.cdn.example/photos/logo.svg")),
      Some(Strategy::StaleWhileRevalidate)
    );
  }

  #[test]
  fn test_same_origin_image_is_cache_first() {
    let request = get("https://habesha.example/icons/heart").with_destination(Destination::Image);
    assert_eq!(rules().route(&request), Some(Strategy::CacheFirst));
  }

  #[test]
  fn test_other_same_origin_is_stale_while_revalidate() {
    assert_eq!(
      rules().route(&Request::navigate(Url::parse("https://habesha.example/events").unwrap())),
      Some(Strategy::StaleWhileRevalidate)
    );
    assert_eq!(
      rules().route(&get("https://habesha.example/assets/index.js")),
      Some(Strategy::StaleWhileRevalidate)
    );
  }

  #[test]
  fn test_routing_is_deterministic() {
    let rules = rules();
    let request = get("https://habesha.example/api/bookings");
    let first = rules.route(&request);
    for _ in 0..10 {
      assert_eq!(rules.route(&request), first);
    }
  }
}
