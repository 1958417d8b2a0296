//! Push payloads and notification clicks.

use color_eyre::Result;
use serde::Deserialize;
use url::Url;

const DEFAULT_TITLE: &str = "HabeshaCommunity";
const DEFAULT_ICON: &str = "/icon-192.png";

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: Option<String>,
  pub tag: Option<String>,
  /// Page to open when the notification is clicked
  pub url: String,
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  tag: Option<String>,
  url: Option<String>,
}

impl Notification {
  /// Build a notification from a push message body.
  ///
  /// JSON payloads fill the fields they carry; any other payload becomes the
  /// body text under the default title.
  pub fn from_push(payload: Option<&[u8]>) -> Self {
    let payload = payload.unwrap_or_default();
    let parsed = match serde_json::from_slice::<PushPayload>(payload) {
      Ok(parsed) => parsed,
      Err(_) => PushPayload {
        body: Some(String::from_utf8_lossy(payload).trim().to_string()).filter(|b| !b.is_empty()),
        ..PushPayload::default()
      },
    };

    Self {
      title: parsed.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: parsed.body.unwrap_or_default(),
      icon: parsed.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
      badge: parsed.badge,
      tag: parsed.tag,
      url: parsed.url.unwrap_or_else(|| "/".to_string()),
    }
  }

  /// Absolute URL to open for this notification. Falls back to the origin
  /// root when the stored URL does not resolve.
  pub fn target(&self, origin: &Url) -> Url {
    origin.join(&self.url).unwrap_or_else(|_| origin.clone())
  }
}

/// Where notifications are displayed and windows opened.
pub trait NotificationHost: Send + Sync {
  fn show_notification(&self, notification: &Notification) -> Result<()>;

  fn open_window(&self, url: &Url) -> Result<()>;
}
