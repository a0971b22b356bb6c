use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info};

const CODE_LEN: usize = 6;
const CODE_TTL_MINUTES: i64 = 10;

/// How often the sweeper evicts expired codes that nobody looked up.
pub const CODE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodePurpose {
    Registration,
    Login,
}

impl CodePurpose {
    pub fn label(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Login => "login",
        }
    }
}

struct CodeEntry {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Expiry-aware one-time-code store, keyed by (phone, purpose).
///
/// Entries are evicted lazily on lookup and periodically by the sweeper, so
/// the map cannot grow without bound. Verification is single-use: a
/// successful match removes the entry.
#[derive(Clone)]
pub struct CodeStore {
    entries: Arc<Mutex<HashMap<(String, CodePurpose), CodeEntry>>>,
}

impl CodeStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issue a fresh code for the subject, replacing any outstanding one.
    pub fn issue(&self, phone: &str, purpose: CodePurpose) -> String {
        let code = generate_code();
        self.insert_with_expiry(
            phone,
            purpose,
            code.clone(),
            Utc::now() + chrono::Duration::minutes(CODE_TTL_MINUTES),
        );
        code
    }

    pub fn insert_with_expiry(
        &self,
        phone: &str,
        purpose: CodePurpose,
        code: String,
        expires_at: DateTime<Utc>,
    ) {
        let mut entries = self.entries.lock().expect("code store lock poisoned");
        entries.insert((phone.to_string(), purpose), CodeEntry { code, expires_at });
    }

    /// Check a submitted code. Expired entries are evicted on the spot;
    /// a successful match consumes the entry.
    pub fn verify(&self, phone: &str, purpose: CodePurpose, code: &str) -> bool {
        let mut entries = self.entries.lock().expect("code store lock poisoned");
        let key = (phone.to_string(), purpose);

        let Some(entry) = entries.get(&key) else {
            return false;
        };
        if entry.expires_at <= Utc::now() {
            entries.remove(&key);
            return false;
        }
        if entry.code != code {
            return false;
        }
        entries.remove(&key);
        true
    }

    /// Drop every expired entry. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("code store lock poisoned");
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("code store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Background task that evicts codes nobody came back for.
pub async fn run_code_sweeper(store: CodeStore, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let evicted = store.evict_expired();
        if evicted > 0 {
            debug!("Code sweeper: evicted {} expired codes", evicted);
        }
    }
}

/// Narrow delivery seam. Real SMS/email delivery is an external
/// collaborator; the shipped implementation just logs.
pub trait CodeSender: Send + Sync {
    fn send_code(&self, phone: &str, code: &str, purpose: CodePurpose);
}

pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send_code(&self, phone: &str, code: &str, purpose: CodePurpose) {
        info!("one-time {} code for {}: {}", purpose.label(), phone, code);
    }
}
