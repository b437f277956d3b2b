//! Round-robin key rotation with rate-limit penalties
//!
//! The pool owns the ordered key list and a rotation state made of a cursor and
//! a penalty map. Both live behind one `tokio::sync::Mutex`, so every scan and
//! every penalty update is serialized, and waiters are admitted in FIFO order.
//!
//! A penalized key stays parked until its resume time; the entry is dropped
//! lazily the next time a scan finds it expired. When every key is parked,
//! `acquire` releases the lock, sleeps until the soonest resume time and scans
//! again from scratch, since other callers may have changed the state while it
//! slept.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One upstream API key.
pub type Credential = Secret<String>;

/// Mutable rotation state, only touched while holding the pool lock.
#[derive(Debug, Default)]
struct Rotation {
    cursor: usize,
    penalties: HashMap<Credential, Instant>,
}

/// Pool of upstream API keys.
///
/// Construct once at startup and share via `Arc`. Keys are fixed for the
/// lifetime of the pool.
pub struct KeyPool {
    credentials: Vec<Credential>,
    rotation: Mutex<Rotation>,
    default_cooldown: Duration,
}

impl KeyPool {
    /// Create a pool over `credentials`, in rotation order.
    ///
    /// `default_cooldown` is how long a key stays parked when the upstream
    /// gives no usable resume time. An empty key list is rejected.
    pub fn new(credentials: Vec<Credential>, default_cooldown: Duration) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }
        info!(
            keys = credentials.len(),
            cooldown_secs = default_cooldown.as_secs(),
            "key pool initialized"
        );
        Ok(Self {
            credentials,
            rotation: Mutex::new(Rotation::default()),
            default_cooldown,
        })
    }

    /// Next eligible key in rotation order.
    ///
    /// Suspends while every key is penalized. Never fails.
    pub async fn acquire(&self) -> Credential {
        self.acquire_with_cooldown(Duration::ZERO).await
    }

    /// Like [`acquire`](Self::acquire), but parks the returned key for
    /// `preventive` right away when it is non-zero, so the caller throttles
    /// the key itself regardless of what the upstream reports.
    pub async fn acquire_with_cooldown(&self, preventive: Duration) -> Credential {
        loop {
            let wake_at = {
                let mut rotation = self.rotation.lock().await;
                let now = Instant::now();
                if let Some(credential) = self.scan(&mut rotation, now, preventive) {
                    return credential;
                }
                rotation.penalties.values().min().copied()
            };

            match wake_at {
                Some(at) => {
                    debug!(
                        wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "all keys penalized, waiting for the soonest resume time"
                    );
                    metrics::counter!("key_pool_waits_total").increment(1);
                    tokio::time::sleep_until(at).await;
                }
                // A full scan only fails when every key has an entry.
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// One rotation over the keys starting at the cursor.
    fn scan(&self, rotation: &mut Rotation, now: Instant, preventive: Duration) -> Option<Credential> {
        let n = self.credentials.len();
        for _ in 0..n {
            let credential = &self.credentials[rotation.cursor];
            rotation.cursor = (rotation.cursor + 1) % n;

            if let Some(&resume_at) = rotation.penalties.get(credential) {
                if resume_at > now {
                    continue;
                }
                rotation.penalties.remove(credential);
                info!(key = %credential.hint(), "penalty expired, key eligible again");
            }

            if !preventive.is_zero() {
                rotation
                    .penalties
                    .insert(credential.clone(), now + preventive);
                debug!(
                    key = %credential.hint(),
                    cooldown_ms = preventive.as_millis() as u64,
                    "preventive cooldown applied"
                );
            }
            return Some(credential.clone());
        }
        None
    }

    /// Park `credential` until the resume time derived from `resume_hint`.
    ///
    /// `resume_hint` is the raw numeric timestamp recovered from the upstream
    /// response, in seconds or milliseconds since the epoch. Without a hint, or
    /// when the hint does not land in the future, the default cooldown applies.
    /// A later penalty always replaces an earlier one.
    pub async fn penalize(&self, credential: &Credential, resume_hint: Option<u64>) {
        let mut rotation = self.rotation.lock().await;
        let now = Instant::now();
        let resume_at = self.resolve_resume_at(resume_hint, now, epoch_millis());
        rotation.penalties.insert(credential.clone(), resume_at);
        drop(rotation);

        let source = if resume_hint.is_some() { "upstream" } else { "default" };
        info!(
            key = %credential.hint(),
            resume_in_ms = (resume_at - now).as_millis() as u64,
            source,
            "key penalized"
        );
        metrics::counter!("key_pool_penalties_total", "source" => source).increment(1);
    }

    /// Keys that `acquire` could hand out right now.
    pub async fn eligible_count(&self) -> usize {
        let rotation = self.rotation.lock().await;
        let now = Instant::now();
        self.credentials
            .iter()
            .filter(|c| rotation.penalties.get(*c).is_none_or(|at| *at <= now))
            .count()
    }

    fn resolve_resume_at(&self, resume_hint: Option<u64>, now: Instant, now_ms: u64) -> Instant {
        let fallback = now + self.default_cooldown;
        let Some(hint) = resume_hint else {
            return fallback;
        };

        let resume_ms = hint_to_epoch_millis(hint, now_ms);
        if resume_ms <= now_ms {
            debug!(hint, "resume hint is not in the future, using default cooldown");
            return fallback;
        }
        now + Duration::from_millis(resume_ms - now_ms)
    }
}

/// Interpret a raw resume timestamp as epoch milliseconds.
///
/// - above the current epoch-millis: already milliseconds
/// - between epoch-seconds and epoch-millis: also read as milliseconds
/// - at or below the current epoch-seconds: seconds, scaled by 1000
///
/// A future epoch-seconds value lands in the middle band and therefore
/// resolves to a past instant; see DESIGN.md.
fn hint_to_epoch_millis(hint: u64, now_ms: u64) -> u64 {
    let now_secs = now_ms / 1000;
    if hint > now_ms {
        hint
    } else if hint > now_secs {
        hint
    } else {
        hint.saturating_mul(1000)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
