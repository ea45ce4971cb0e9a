use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const BANLIST_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BannedPeer {
    pub addr: SocketAddr,
    pub banned_until: u64,
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    addr: SocketAddr,
    banned_until: u64,
    #[serde(default)]
    reason: String,
}

#[derive(Clone, Debug)]
struct Ban {
    until: SystemTime,
    reason: String,
}

/// Per-address reputation and time-limited bans for outbound peers.
#[derive(Debug)]
pub struct PeerBook {
    ban_duration: Duration,
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, Ban>>,
    revision: AtomicU64,
}

impl Default for PeerBook {
    fn default() -> Self {
        Self::new(DEFAULT_BAN_DURATION)
    }
}

impl PeerBook {
    pub fn new(ban_duration: Duration) -> Self {
        Self {
            ban_duration,
            scores: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    /// A batch from this peer was committed.
    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_add(3);
        }
    }

    /// Connect failure, timeout or early disconnect.
    pub fn record_failure(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn ban(&self, addr: SocketAddr, reason: &str) {
        self.record_failure(addr);
        self.ban_for(addr, self.ban_duration, reason);
    }

    pub fn ban_for(&self, addr: SocketAddr, duration: Duration, reason: &str) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(
                addr,
                Ban {
                    until: SystemTime::now() + duration,
                    reason: reason.to_string(),
                },
            );
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(ban) = banned.get(&addr) {
            if ban.until > now {
                return true;
            }
            banned.remove(&addr);
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        let removed = banned.remove(&addr).is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Best-scoring addresses that are not banned.
    pub fn preferred(&self, limit: usize) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let entries: Vec<(SocketAddr, i32)> = match self.scores.lock() {
            Ok(scores) => scores
                .iter()
                .filter(|(_, score)| **score > 0)
                .map(|(addr, score)| (*addr, *score))
                .collect(),
            Err(_) => return Vec::new(),
        };
        let mut entries: Vec<(SocketAddr, i32)> = entries
            .into_iter()
            .filter(|(addr, _)| !self.is_banned(*addr))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries.into_iter().map(|(addr, _)| addr).collect()
    }

    pub fn banned_peers(&self) -> Vec<BannedPeer> {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return Vec::new();
        };
        let before = banned.len();
        banned.retain(|_, ban| ban.until > now);
        if banned.len() != before {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        let mut out: Vec<BannedPeer> = banned
            .iter()
            .map(|(addr, ban)| BannedPeer {
                addr: *addr,
                banned_until: unix_secs(ban.until),
                reason: ban.reason.clone(),
            })
            .collect();
        out.sort_by_key(|peer| peer.addr);
        out
    }

    pub fn banlist_revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    pub fn load_banlist(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {BANLIST_VERSION})",
                file.version
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        if let Ok(mut banned) = self.banned.lock() {
            for entry in file.banned {
                let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
                if until <= now {
                    continue;
                }
                banned.insert(
                    entry.addr,
                    Ban {
                        until,
                        reason: entry.reason,
                    },
                );
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Writes unexpired bans via a temp file and rename.
    pub fn save_banlist(&self, path: &Path) -> Result<(), String> {
        let banned = self
            .banned_peers()
            .into_iter()
            .map(|peer| BanListEntry {
                addr: peer.addr,
                banned_until: peer.banned_until,
                reason: peer.reason,
            })
            .collect();
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: &str) -> SocketAddr {
        raw.parse().expect("addr")
    }

    #[test]
    fn scores_order_preferred_peers() {
        let book = PeerBook::default();
        let a = addr("10.0.0.1:8333");
        let b = addr("10.0.0.2:8333");
        let c = addr("10.0.0.3:8333");
        book.record_success(a);
        book.record_success(b);
        book.record_success(b);
        book.record_failure(c);
        assert_eq!(book.preferred(5), vec![b, a]);
        assert_eq!(book.preferred(1), vec![b]);
        assert!(book.preferred(0).is_empty());

        book.ban(b, "invalid header");
        assert!(book.is_banned(b));
        assert_eq!(book.preferred(5), vec![a]);
        assert!(book.unban(b));
        assert!(!book.is_banned(b));
    }

    #[test]
    fn expired_bans_are_dropped() {
        let book = PeerBook::new(Duration::ZERO);
        let a = addr("10.0.0.1:8333");
        book.ban(a, "test");
        assert!(!book.is_banned(a));
        assert!(book.banned_peers().is_empty());
    }

    #[test]
    fn banlist_survives_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("banlist.json");
        let book = PeerBook::default();
        let a = addr("10.0.0.1:8333");
        book.ban(a, "malformed headers");
        let revision = book.banlist_revision();
        assert!(revision > 0);
        book.save_banlist(&path).expect("save");

        let restored = PeerBook::default();
        assert_eq!(restored.load_banlist(&path).expect("load"), 1);
        assert!(restored.is_banned(a));
        assert_eq!(restored.banned_peers()[0].reason, "malformed headers");
        assert_eq!(
            PeerBook::default()
                .load_banlist(&dir.path().join("missing.json"))
                .expect("missing"),
            0
        );

        fs::write(&path, br#"{"version":9,"banned":[]}"#).expect("write");
        assert!(restored.load_banlist(&path).is_err());
    }
}
