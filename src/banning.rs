/// Timed in-memory IP bans.
///
/// Sources of bans: junk on the wire, failed TLS handshakes, and whatever
/// out-of-core policy decides to call `ban`. Entries expire lazily on lookup
/// and are swept opportunistically.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub struct BanManager {
    bans: RwLock<HashMap<IpAddr, Instant>>,
}

impl Default for BanManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BanManager {
    pub fn new() -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ban(&self, ip: IpAddr, duration: Duration) {
        let until = Instant::now() + duration;
        let mut bans = self.bans.write().await;
        // Extend only; never shorten an existing ban.
        let entry = bans.entry(ip).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        {
            let bans = self.bans.read().await;
            match bans.get(&ip) {
                Some(until) if *until > now => return true,
                None => return false,
                Some(_) => {}
            }
        }
        // Expired; drop the entry.
        let mut bans = self.bans.write().await;
        if let Some(until) = bans.get(&ip).copied() {
            if until <= now {
                bans.remove(&ip);
                return false;
            }
            return true;
        }
        false
    }

    pub async fn banned_count(&self) -> usize {
        let now = Instant::now();
        self.bans.read().await.values().filter(|u| **u > now).count()
    }
}
