use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use headerd_storage::{Column, KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthHeader {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<AuthHeader>,
    pub created_at: u64,
    #[serde(default)]
    pub last_emitted_at: Option<u64>,
    #[serde(default)]
    pub error_count: u32,
    pub active: bool,
}

/// Registered webhook endpoints in the `webhook` column, keyed by url.
pub struct WebhookStore<S> {
    store: Arc<S>,
    max_tries: u32,
    write_lock: Mutex<()>,
}

pub fn validate_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| format!("webhook url '{url}' must be http or https"))?;
    if rest.is_empty() || rest.starts_with('/') || url.chars().any(char::is_whitespace) {
        return Err(format!("webhook url '{url}' has no host"));
    }
    Ok(())
}

impl<S: KeyValueStore> WebhookStore<S> {
    pub fn new(store: Arc<S>, max_tries: u32) -> Self {
        Self {
            store,
            max_tries: max_tries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Adds or re-activates a webhook. Re-registering resets its error count.
    pub fn register(&self, url: &str, auth_header: Option<AuthHeader>) -> Result<Webhook, StoreError> {
        let _guard = self.lock()?;
        let created_at = match self.get(url)? {
            Some(existing) => existing.created_at,
            None => unix_now(),
        };
        let webhook = Webhook {
            url: url.to_string(),
            auth_header,
            created_at,
            last_emitted_at: None,
            error_count: 0,
            active: true,
        };
        self.put(&webhook)?;
        Ok(webhook)
    }

    pub fn revoke(&self, url: &str) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        if self.get(url)?.is_none() {
            return Ok(false);
        }
        self.store.delete(Column::Webhook, url.as_bytes())?;
        Ok(true)
    }

    pub fn get(&self, url: &str) -> Result<Option<Webhook>, StoreError> {
        match self.store.get(Column::Webhook, url.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<Webhook>, StoreError> {
        self.store
            .scan_prefix(Column::Webhook, &[])?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    pub fn active(&self) -> Result<Vec<Webhook>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|webhook| webhook.active)
            .collect())
    }

    /// Records one delivery attempt. After `max_tries` consecutive failures
    /// the webhook is deactivated. Returns the updated record, or `None` if
    /// it was revoked meanwhile.
    pub fn record_delivery(&self, url: &str, delivered: bool) -> Result<Option<Webhook>, StoreError> {
        let _guard = self.lock()?;
        let Some(mut webhook) = self.get(url)? else {
            return Ok(None);
        };
        if delivered {
            webhook.error_count = 0;
            webhook.last_emitted_at = Some(unix_now());
        } else {
            webhook.error_count = webhook.error_count.saturating_add(1);
            if webhook.error_count >= self.max_tries {
                webhook.active = false;
            }
        }
        self.put(&webhook)?;
        Ok(Some(webhook))
    }

    fn put(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(webhook).map_err(|err| StoreError::Backend(err.to_string()))?;
        self.store
            .put(Column::Webhook, webhook.url.as_bytes(), &bytes)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Backend("webhook lock poisoned".to_string()))
    }
}

fn decode(bytes: &[u8]) -> Result<Webhook, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt(format!("webhook: {err}")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use headerd_storage::memory::MemoryStore;

    const URL: &str = "http://127.0.0.1:9/hook";

    #[test]
    fn validates_urls() {
        assert!(validate_url(URL).is_ok());
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("http://").is_err());
        assert!(validate_url("http:///path").is_err());
    }

    #[test]
    fn register_list_and_revoke() {
        let hooks = WebhookStore::new(Arc::new(MemoryStore::new()), 3);
        let auth = AuthHeader {
            name: "X-Key".to_string(),
            value: "secret".to_string(),
        };
        let hook = hooks.register(URL, Some(auth.clone())).expect("register");
        assert!(hook.active);
        assert_eq!(hooks.list().expect("list"), vec![hook.clone()]);
        assert_eq!(
            hooks.get(URL).expect("get").expect("present").auth_header,
            Some(auth)
        );
        assert!(hooks.revoke(URL).expect("revoke"));
        assert!(!hooks.revoke(URL).expect("missing"));
        assert!(hooks.list().expect("list").is_empty());
    }

    #[test]
    fn consecutive_failures_deactivate() {
        let hooks = WebhookStore::new(Arc::new(MemoryStore::new()), 3);
        hooks.register(URL, None).expect("register");

        hooks.record_delivery(URL, false).expect("fail");
        hooks.record_delivery(URL, false).expect("fail");
        let hook = hooks.record_delivery(URL, true).expect("ok").expect("present");
        assert_eq!(hook.error_count, 0);
        assert!(hook.last_emitted_at.is_some());

        for _ in 0..2 {
            hooks.record_delivery(URL, false).expect("fail");
        }
        assert_eq!(hooks.active().expect("active").len(), 1);
        let hook = hooks.record_delivery(URL, false).expect("fail").expect("present");
        assert!(!hook.active);
        assert!(hooks.active().expect("active").is_empty());

        let hook = hooks.register(URL, None).expect("re-register");
        assert!(hook.active);
        assert_eq!(hook.error_count, 0);
        assert!(hooks.record_delivery("http://unknown/", true).expect("missing").is_none());
    }
}
