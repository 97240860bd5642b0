//! Fixed-window per-client enqueue quota.
//!
//! Reserve and commit are separate on purpose: a reservation is a hold, and
//! only a commit (issued after the vibe check and the upstream write both
//! succeed) spends the allowance. A reservation that is dropped without
//! committing releases its hold, so rejected requests cost nothing.
//!
//! Windows roll lazily on access; there are no background timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aux_proto::protocol::QuotaStatus;
use chrono::{DateTime, Duration, Utc};

use crate::error::AdmissionError;

#[derive(Debug)]
struct Window {
    committed: u32,
    /// Holds from reservations that have neither committed nor dropped yet.
    /// Counted against admission so a concurrent burst cannot over-commit.
    pending: u32,
    window_start: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    limit: u32,
    window: Duration,
    clients: Mutex<HashMap<String, Window>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct QuotaTracker {
    inner: Arc<Inner>,
}

/// A hold on one enqueue slot. Commit it through the tracker, or drop it to
/// release the hold.
#[derive(Debug)]
pub struct Reservation {
    inner: Arc<Inner>,
    client_id: String,
    window_start: DateTime<Utc>,
    released: bool,
}

impl QuotaTracker {
    pub fn new(limit: u32, window_minutes: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                window: Duration::minutes(window_minutes),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit or refuse a new attempt. Never touches the committed counter.
    pub fn try_reserve(&self, client_id: &str) -> Result<Reservation, AdmissionError> {
        let now = Utc::now();
        let mut clients = self.inner.lock();
        let window = clients
            .entry(client_id.to_string())
            .or_insert_with(|| Window {
                committed: 0,
                pending: 0,
                window_start: now,
            });
        roll_if_lapsed(window, self.inner.window, now);

        if window.committed + window.pending >= self.inner.limit {
            return Err(AdmissionError::QuotaExceeded {
                reset_at: window.window_start + self.inner.window,
            });
        }
        window.pending += 1;
        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            client_id: client_id.to_string(),
            window_start: window.window_start,
            released: false,
        })
    }

    /// Spend the reserved slot. Only called once every later check has
    /// succeeded; returns the post-commit snapshot for the response.
    pub fn commit(&self, mut reservation: Reservation) -> QuotaStatus {
        let now = Utc::now();
        let mut clients = self.inner.lock();
        let window = clients
            .entry(reservation.client_id.clone())
            .or_insert_with(|| Window {
                committed: 0,
                pending: 0,
                window_start: now,
            });
        roll_if_lapsed(window, self.inner.window, now);

        if window.window_start == reservation.window_start {
            window.pending = window.pending.saturating_sub(1);
        }
        window.committed += 1;
        reservation.released = true;

        QuotaStatus {
            limit: self.inner.limit,
            remaining: self.inner.limit.saturating_sub(window.committed),
            reset_at: window.window_start + self.inner.window,
        }
    }

    /// Non-mutating snapshot. A lapsed window reads as full capacity; the
    /// stored entry is left alone.
    pub fn peek(&self, client_id: &str) -> QuotaStatus {
        let now = Utc::now();
        let clients = self.inner.lock();
        match clients.get(client_id) {
            Some(w) if now - w.window_start < self.inner.window => QuotaStatus {
                limit: self.inner.limit,
                remaining: self.inner.limit.saturating_sub(w.committed),
                reset_at: w.window_start + self.inner.window,
            },
            _ => QuotaStatus {
                limit: self.inner.limit,
                remaining: self.inner.limit,
                reset_at: now + self.inner.window,
            },
        }
    }

    #[cfg(test)]
    fn backdate_window(&self, client_id: &str, by: Duration) {
        let mut clients = self.inner.lock();
        if let Some(w) = clients.get_mut(client_id) {
            w.window_start = w.window_start - by;
        }
    }
}

fn roll_if_lapsed(window: &mut Window, length: Duration, now: DateTime<Utc>) {
    if now - window.window_start >= length {
        window.committed = 0;
        window.pending = 0;
        window.window_start = now;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut clients = self.inner.lock();
        if let Some(w) = clients.get_mut(&self.client_id) {
            // Only release into the window the hold was taken from; if it
            // rolled meanwhile, the hold was already wiped with it.
            if w.window_start == self.window_start {
                w.pending = w.pending.saturating_sub(1);
            }
        }
    }
}
