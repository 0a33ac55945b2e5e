//! Notification de-duplication for denials.
//!
//! Many job cards can hit the same throttled endpoint at once. [`NoticeGate`] lets the
//! caller show one notice per denial period: the first denial persists a marker under
//! `rateLimitNotice:{endpoint}` that suppresses further notices until it expires. A
//! lockout escalates past an outstanding throttle marker so the user always learns
//! about the longer wait.

use crate::clock::{duration_millis, Clock};
use crate::error::StorageError;
use crate::rate_limit::Decision;
use crate::storage::{KeyValueStore, Record};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prefix of the per-endpoint marker key.
pub const NOTICE_KEY_PREFIX: &str = "rateLimitNotice:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NoticeKind {
    Throttle,
    Lockout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct NoticeMarker {
    until: u64,
    kind: NoticeKind,
}

/// Decides whether a denial deserves a user-visible notice.
#[derive(Debug, Clone)]
pub struct NoticeGate {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl NoticeGate {
    pub fn new<K, C>(store: K, clock: C) -> Self
    where
        K: KeyValueStore + 'static,
        C: Clock + 'static,
    {
        Self { store: Arc::new(store), clock: Arc::new(clock) }
    }

    /// `true` if a notice should be shown for `decision` on `endpoint`.
    ///
    /// Allowed decisions never notify. If the marker cannot be read, this errs on the
    /// side of notifying.
    pub async fn should_notify(&self, endpoint: &str, decision: &Decision) -> bool {
        let Decision::Denied { retry_after, .. } = decision else {
            return false;
        };
        let kind = if decision.is_locked_out() { NoticeKind::Lockout } else { NoticeKind::Throttle };
        let key = notice_key(endpoint);
        let now = self.clock.now_millis();

        match self.store.get(&[key.as_str()]).await {
            Ok(record) => match read_marker(&record, &key) {
                Ok(marker) => {
                    if marker.is_some_and(|m| m.until > now && m.kind >= kind) {
                        return false;
                    }
                }
                Err(err) => tracing::warn!(endpoint, error = %err, "replacing unreadable notice marker"),
            },
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "failed to read notice marker");
                return true;
            }
        }

        let marker = NoticeMarker {
            until: now.saturating_add(duration_millis(*retry_after).max(1)),
            kind,
        };
        match serde_json::to_value(marker) {
            Ok(value) => {
                if let Err(err) = self.store.set(Record::from([(key, value)])).await {
                    tracing::warn!(endpoint, error = %err, "failed to persist notice marker");
                }
            }
            Err(err) => tracing::warn!(endpoint, error = %err, "failed to encode notice marker"),
        }
        true
    }

    /// Forget the marker for `endpoint`.
    pub async fn clear(&self, endpoint: &str) {
        let key = notice_key(endpoint);
        if let Err(err) = self.store.remove(&[key.as_str()]).await {
            tracing::warn!(endpoint, error = %err, "failed to clear notice marker");
        }
    }
}

fn read_marker(record: &Record, key: &str) -> Result<Option<NoticeMarker>, StorageError> {
    record
        .get(key)
        .map(|value| {
            serde_json::from_value::<NoticeMarker>(value.clone()).map_err(|err| {
                StorageError::Corrupt { key: key.to_string(), reason: err.to_string() }
            })
        })
        .transpose()
}

fn notice_key(endpoint: &str) -> String {
    format!("{NOTICE_KEY_PREFIX}{endpoint}")
}
