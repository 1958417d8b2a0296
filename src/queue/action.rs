use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of writes that can be queued while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Favorite,
  Message,
  Listing,
  Booking,
}

impl ActionKind {
  pub const ALL: [ActionKind; 4] = [
    ActionKind::Favorite,
    ActionKind::Message,
    ActionKind::Listing,
    ActionKind::Booking,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      ActionKind::Favorite => "favorite",
      ActionKind::Message => "message",
      ActionKind::Listing => "listing",
      ActionKind::Booking => "booking",
    }
  }

  /// Backend table the write lands in
  pub fn table(self) -> &'static str {
    match self {
      ActionKind::Favorite => "favorites",
      ActionKind::Message => "messages",
      ActionKind::Listing => "listings",
      ActionKind::Booking => "bookings",
    }
  }
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ActionKind::ALL
      .into_iter()
      .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| format!("unknown action type '{}'", s))
  }
}

/// A write waiting to be replayed against the backend.
///
/// This is the persisted shape: the deferred operation itself lives outside
/// the record and is rebuilt from `kind` + `data` when it is not in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: ActionKind,
  pub data: serde_json::Value,
  /// Creation time, epoch milliseconds
  pub timestamp: i64,
  #[serde(default)]
  pub retries: u32,
}

impl QueuedAction {
  pub fn new(kind: ActionKind, data: serde_json::Value) -> Self {
    let timestamp = Utc::now().timestamp_millis();
    Self {
      id: generate_id(kind, timestamp),
      kind,
      data,
      timestamp,
      retries: 0,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    Duration::milliseconds(now.timestamp_millis() - self.timestamp)
  }
}

/// `{type}-{timestamp}-{suffix}` with a 9 character random suffix
fn generate_id(kind: ActionKind, timestamp: i64) -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(9)
    .map(|b| char::from(b).to_ascii_lowercase())
    .collect();
  format!("{}-{}-{}", kind, timestamp, suffix)
}

/// When a failing action stops being retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub max_age: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      max_age: Duration::hours(24),
    }
  }
}

impl RetryPolicy {
  pub fn is_exhausted(&self, action: &QueuedAction, now: DateTime<Utc>) -> bool {
    action.retries >= self.max_retries || action.age(now) > self.max_age
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_id_format() {
    let action = QueuedAction::new(ActionKind::Favorite, json!({"listing_id": 7}));
    let parts: Vec<&str> = action.id.splitn(3, '-').collect();

    assert_eq!(parts[0], "favorite");
    assert_eq!(parts[1], action.timestamp.to_string());
    assert_eq!(parts[2].len(), 9);
    assert!(parts[2]
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert_eq!(action.retries, 0);
  }

  #[test]
  fn test_ids_are_unique() {
    let a = QueuedAction::new(ActionKind::Message, json!(null));
    let b = QueuedAction::new(ActionKind::Message, json!(null));
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_persisted_shape_uses_type_field() {
    let action = QueuedAction {
      id: "booking-1-abc".to_string(),
      kind: ActionKind::Booking,
      data: json!({"slot": "10:00"}),
      timestamp: 1,
      retries: 2,
    };
    let value = serde_json::to_value(&action).unwrap();
    assert_eq!(value["type"], "booking");
    assert_eq!(value["retries"], 2);

    let back: QueuedAction = serde_json::from_value(value).unwrap();
    assert_eq!(back, action);
  }

  #[test]
  fn test_kind_from_str() {
    assert_eq!("Listing".parse::<ActionKind>(), Ok(ActionKind::Listing));
    assert!("like".parse::<ActionKind>().is_err());
  }

  #[test]
  fn test_policy_retry_ceiling() {
    let policy = RetryPolicy::default();
    let mut action = QueuedAction::new(ActionKind::Favorite, json!({}));
    let now = Utc::now();

    action.retries = 2;
    assert!(!policy.is_exhausted(&action, now));
    action.retries = 3;
    assert!(policy.is_exhausted(&action, now));
  }

  #[test]
  fn test_policy_age_ceiling() {
    let policy = RetryPolicy::default();
    let mut action = QueuedAction::new(ActionKind::Favorite, json!({}));
    let now = Utc::now();

    action.timestamp = (now - Duration::hours(23)).timestamp_millis();
    assert!(!policy.is_exhausted(&action, now));
    action.timestamp = (now - Duration::hours(25)).timestamp_millis();
    assert!(policy.is_exhausted(&action, now));
  }
}
