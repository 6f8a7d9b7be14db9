//! Rolling upload quota for standard accounts.
//!
//! The window opens with the first upload and lasts ten hours. Attempts
//! are refused once the count reaches the limit; a single attempt may
//! carry several files and push the count past it. The first attempt after
//! the window lapses starts a new window at zero.

use super::store::{KeyValueStore, FIRST_UPLOAD_KEY, UPLOAD_COUNT_KEY};
use crate::error::{VoiceError, VoiceResult};

/// Default: 5 uploads per window.
pub const UPLOAD_LIMIT: u32 = 5;

/// Default window: 10 hours, in milliseconds.
pub const UPLOAD_WINDOW_MS: u64 = 10 * 60 * 60 * 1000;

/// Current epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadQuota {
    limit: u32,
    window_ms: u64,
    count: u32,
    first_upload_ms: Option<u64>,
}

impl Default for UploadQuota {
    fn default() -> Self {
        Self::with_limits(UPLOAD_LIMIT, UPLOAD_WINDOW_MS)
    }
}

impl UploadQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            count: 0,
            first_upload_ms: None,
        }
    }

    /// Restore persisted counters, discarding a window that already lapsed.
    pub fn load_at(store: &dyn KeyValueStore, now_ms: u64) -> Self {
        let mut quota = Self::default();
        let first = store
            .get(FIRST_UPLOAD_KEY)
            .and_then(|v| v.parse::<u64>().ok());

        match first {
            Some(first) if now_ms.saturating_sub(first) < quota.window_ms => {
                quota.first_upload_ms = Some(first);
                quota.count = store
                    .get(UPLOAD_COUNT_KEY)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
            }
            _ => {
                store.remove(UPLOAD_COUNT_KEY);
                store.remove(FIRST_UPLOAD_KEY);
            }
        }
        quota
    }

    pub fn save(&self, store: &dyn KeyValueStore) {
        match self.first_upload_ms {
            Some(first) => {
                store.set(FIRST_UPLOAD_KEY, first.to_string());
                store.set(UPLOAD_COUNT_KEY, self.count.to_string());
            }
            None => {
                store.remove(FIRST_UPLOAD_KEY);
                store.remove(UPLOAD_COUNT_KEY);
            }
        }
    }

    pub fn try_consume(&mut self, files: u32) -> VoiceResult<u32> {
        self.try_consume_at(files, now_ms())
    }

    /// Record an attempt to upload `files` files at `now_ms`.
    ///
    /// Returns the uploads left in the window.
    pub fn try_consume_at(&mut self, files: u32, now_ms: u64) -> VoiceResult<u32> {
        if files == 0 {
            return Ok(self.remaining());
        }

        let expired = self
            .first_upload_ms
            .is_none_or(|first| now_ms.saturating_sub(first) > self.window_ms);
        if expired {
            self.first_upload_ms = Some(now_ms);
            self.count = 0;
        }

        if self.count >= self.limit {
            tracing::debug!(used = self.count, limit = self.limit, "Upload refused, quota exhausted");
            return Err(VoiceError::UploadLimitReached {
                used: self.count,
                limit: self.limit,
            });
        }

        self.count = self.count.saturating_add(files);
        Ok(self.remaining())
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.first_upload_ms = None;
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn first_upload_ms(&self) -> Option<u64> {
        self.first_upload_ms
    }
}
