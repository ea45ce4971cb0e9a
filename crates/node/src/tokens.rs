use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use headerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const TOKEN_BYTES: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub admin: bool,
    pub created_at: u64,
}

/// Bearer tokens, keyed by the token string in the `token` column.
pub struct TokenStore<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> TokenStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Makes `token` the only admin token.
    pub fn ensure_admin(&self, token: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (key, value) in self.store.scan_prefix(Column::Token, &[])? {
            if key != token.as_bytes() && decode(&value)?.admin {
                batch.delete(Column::Token, key.as_slice());
            }
        }
        match self.lookup(token)? {
            Some(record) if record.admin => {}
            _ => {
                let record = TokenRecord {
                    admin: true,
                    created_at: unix_now(),
                };
                batch.put(Column::Token, token.as_bytes(), encode(&record)?.as_slice());
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&batch)
    }

    pub fn create(&self) -> Result<String, StoreError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
        let record = TokenRecord {
            admin: false,
            created_at: unix_now(),
        };
        self.store
            .put(Column::Token, token.as_bytes(), &encode(&record)?)?;
        Ok(token)
    }

    /// Removes a non-admin token. Returns false when no such token exists.
    pub fn revoke(&self, token: &str) -> Result<bool, StoreError> {
        match self.lookup(token)? {
            Some(record) if !record.admin => {
                self.store.delete(Column::Token, token.as_bytes())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn lookup(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        if token.is_empty() {
            return Ok(None);
        }
        match self.store.get(Column::Token, token.as_bytes())? {
            Some(value) => decode(&value).map(Some),
            None => Ok(None),
        }
    }
}

fn encode(record: &TokenRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|err| StoreError::Backend(err.to_string()))
}

fn decode(bytes: &[u8]) -> Result<TokenRecord, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt(format!("token: {err}")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
