use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;

/// One ban. Either identity may be absent; a record matches a client
/// when any present identity matches.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BanRecord {
    #[serde(default)]
    pub ipid: Option<String>,
    #[serde(default)]
    pub hdid: Option<String>,
    #[serde(default)]
    pub reason: String,
}

impl BanRecord {
    fn matches(&self, ipid: &str, hdid: &str) -> bool {
        let ip_hit = !ipid.is_empty() && self.ipid.as_deref() == Some(ipid);
        let hd_hit = !hdid.is_empty() && self.hdid.as_deref() == Some(hdid);
        ip_hit || hd_hit
    }

    fn matches_token(&self, token: &str) -> bool {
        self.ipid.as_deref() == Some(token) || self.hdid.as_deref() == Some(token)
    }
}

/// File-backed ban list, `save/banlist.yaml` under the asset root.
#[derive(Debug, Default)]
pub struct BanList {
    records: Vec<BanRecord>,
}

impl BanList {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A missing file is an empty list; a corrupt one is an error.
    pub fn load(root: &Path) -> Result<Self, String> {
        let path = root.join("save").join("banlist.yaml");
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty())
            }
            Err(err) => return Err(format!("read {} failed: {}", path.display(), err)),
        };
        let records: Vec<BanRecord> = serde_yaml::from_str(&data)
            .map_err(|err| format!("parse {} failed: {}", path.display(), err))?;
        Ok(Self { records })
    }

    pub fn save(&self, root: &Path) -> Result<(), String> {
        let dir = root.join("save");
        fs::create_dir_all(&dir)
            .map_err(|err| format!("create {} failed: {}", dir.display(), err))?;
        let path = dir.join("banlist.yaml");
        let data = serde_yaml::to_string(&self.records)
            .map_err(|err| format!("serialize banlist failed: {}", err))?;
        fs::write(&path, data).map_err(|err| format!("write {} failed: {}", path.display(), err))
    }

    pub fn add(&mut self, record: BanRecord) {
        self.records.push(record);
    }

    /// Lifts every ban matching `token` against either identity.
    /// Returns whether anything was removed.
    pub fn remove(&mut self, token: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|record| !record.matches_token(token));
        self.records.len() != before
    }

    pub fn reason_for(&self, ipid: &str, hdid: &str) -> Option<&str> {
        self.records
            .iter()
            .find(|record| record.matches(ipid, hdid))
            .map(|record| record.reason.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Remembers which hardware ids have been seen from each address, so a
/// ban on one identity also catches the other half of the pairing.
/// Bounded by an LRU so a churned address pool cannot grow without
/// limit.
#[derive(Debug)]
pub struct PairingCache {
    seen: LruCache<String, Vec<String>>,
}

impl PairingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn record(&mut self, ipid: &str, hdid: &str) {
        match self.seen.get_mut(ipid) {
            Some(hdids) => {
                if !hdids.iter().any(|known| known == hdid) {
                    hdids.push(hdid.to_string());
                }
            }
            None => {
                self.seen.put(ipid.to_string(), vec![hdid.to_string()]);
            }
        }
    }

    pub fn hdids_for(&mut self, ipid: &str) -> Vec<String> {
        self.seen.get(ipid).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_match_on_either_identity() {
        let mut bans = BanList::empty();
        bans.add(BanRecord {
            ipid: Some("10.0.0.1".to_string()),
            hdid: Some("aabb".to_string()),
            reason: "spam".to_string(),
        });
        assert_eq!(bans.reason_for("10.0.0.1", "other"), Some("spam"));
        assert_eq!(bans.reason_for("10.9.9.9", "aabb"), Some("spam"));
        assert_eq!(bans.reason_for("10.9.9.9", "other"), None);
        // Empty identities never match anything.
        assert_eq!(bans.reason_for("", ""), None);
    }

    #[test]
    fn remove_lifts_by_either_token() {
        let mut bans = BanList::empty();
        bans.add(BanRecord {
            ipid: Some("10.0.0.1".to_string()),
            hdid: Some("aabb".to_string()),
            reason: "spam".to_string(),
        });
        assert!(bans.remove("aabb"));
        assert!(bans.is_empty());
        assert!(!bans.remove("aabb"));
    }

    #[test]
    fn records_roundtrip_through_yaml() {
        let records = vec![
            BanRecord {
                ipid: Some("10.0.0.1".to_string()),
                hdid: None,
                reason: "one".to_string(),
            },
            BanRecord {
                ipid: None,
                hdid: Some("ccdd".to_string()),
                reason: "two".to_string(),
            },
        ];
        let yaml = serde_yaml::to_string(&records).expect("serialize");
        let parsed: Vec<BanRecord> = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(parsed, records);
    }

    #[test]
    fn pairing_cache_accumulates_and_deduplicates() {
        let mut cache = PairingCache::new(8);
        cache.record("10.0.0.1", "aa");
        cache.record("10.0.0.1", "bb");
        cache.record("10.0.0.1", "aa");
        assert_eq!(cache.hdids_for("10.0.0.1"), vec!["aa", "bb"]);
        assert!(cache.hdids_for("10.0.0.2").is_empty());
    }

    #[test]
    fn pairing_cache_evicts_oldest_address() {
        let mut cache = PairingCache::new(2);
        cache.record("a", "1");
        cache.record("b", "2");
        cache.record("c", "3");
        assert!(cache.hdids_for("a").is_empty());
        assert_eq!(cache.hdids_for("b"), vec!["2"]);
        assert_eq!(cache.hdids_for("c"), vec!["3"]);
    }
}
