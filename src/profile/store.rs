//! Process-lifetime key/value storage for account state.

use parking_lot::Mutex;
use std::collections::HashMap;

pub const LOGGED_IN_KEY: &str = "is_logged_in";
pub const PROFILE_KEY: &str = "user_profile";
pub const UPLOAD_COUNT_KEY: &str = "upload_count";
pub const FIRST_UPLOAD_KEY: &str = "first_upload_time";

/// String-keyed storage backing the account.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-memory store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
