//! Local account state: login flag, profile and upload quota.
//!
//! Login and payment are mocked. Everything lives in a [`KeyValueStore`]
//! that does not outlive the process.

pub mod quota;
pub mod store;

pub use quota::{UploadQuota, UPLOAD_LIMIT, UPLOAD_WINDOW_MS};
pub use store::{KeyValueStore, MemoryStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ProfileDefaults;
use crate::error::VoiceResult;
use crate::i18n::Language;
use crate::voice::VoicePreferences;
use store::{LOGGED_IN_KEY, PROFILE_KEY};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    /// Base64 image or URL.
    pub profile_picture: Option<String>,
    pub is_pro_member: bool,
    pub voice: String,
    pub language: Language,
}

impl UserProfile {
    pub fn from_defaults(defaults: &ProfileDefaults) -> Self {
        Self {
            username: defaults.username.clone(),
            profile_picture: None,
            is_pro_member: defaults.is_pro_member,
            voice: defaults.voice.clone(),
            language: Language::from_code_or_default(&defaults.language),
        }
    }

    pub fn voice_preferences(&self) -> VoicePreferences {
        VoicePreferences {
            voice: self.voice.clone(),
            language: self.language,
        }
    }
}

/// Saved fields win over defaults; fields missing from the saved copy keep
/// their default values.
fn merge_saved(defaults: &UserProfile, saved: &str) -> Option<UserProfile> {
    let mut merged = serde_json::to_value(defaults).ok()?;
    let saved: serde_json::Value = serde_json::from_str(saved).ok()?;
    let (Some(target), serde_json::Value::Object(fields)) = (merged.as_object_mut(), saved) else {
        return None;
    };
    target.extend(fields);
    serde_json::from_value(merged).ok()
}

/// The signed-in user with their profile and upload allowance.
pub struct Account {
    store: Arc<dyn KeyValueStore>,
    profile: UserProfile,
    quota: UploadQuota,
}

impl Account {
    pub fn load(store: Arc<dyn KeyValueStore>, defaults: UserProfile) -> Self {
        Self::load_at(store, defaults, quota::now_ms())
    }

    pub fn load_at(store: Arc<dyn KeyValueStore>, defaults: UserProfile, now_ms: u64) -> Self {
        let profile = match store.get(PROFILE_KEY) {
            Some(saved) => merge_saved(&defaults, &saved).unwrap_or_else(|| {
                tracing::warn!("Ignoring unreadable saved profile");
                defaults
            }),
            None => defaults,
        };
        let quota = UploadQuota::load_at(store.as_ref(), now_ms);
        Self {
            store,
            profile,
            quota,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.store.get(LOGGED_IN_KEY).as_deref() == Some("true")
    }

    pub fn log_in(&self) {
        self.store.set(LOGGED_IN_KEY, "true".into());
        tracing::info!(username = %self.profile.username, "Signed in");
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn update_profile(&mut self, profile: UserProfile) {
        self.profile = profile;
        self.persist_profile();
    }

    /// `None` for pro members, who have no upload limit.
    pub fn uploads_remaining(&self) -> Option<u32> {
        (!self.profile.is_pro_member).then(|| self.quota.remaining())
    }

    pub fn quota(&self) -> &UploadQuota {
        &self.quota
    }

    pub fn authorize_uploads(&mut self, files: u32) -> VoiceResult<()> {
        self.authorize_uploads_at(files, quota::now_ms())
    }

    /// Charge `files` uploads against the quota. Pro members are exempt.
    pub fn authorize_uploads_at(&mut self, files: u32, now_ms: u64) -> VoiceResult<()> {
        if files == 0 || self.profile.is_pro_member {
            return Ok(());
        }
        let result = self.quota.try_consume_at(files, now_ms);
        self.quota.save(self.store.as_ref());
        result.map(|remaining| {
            tracing::debug!(files, remaining, "Uploads authorized");
        })
    }

    /// Mock payment: grants pro membership and clears the quota.
    pub fn upgrade_to_pro(&mut self) {
        self.profile.is_pro_member = true;
        self.persist_profile();
        self.quota.reset();
        self.quota.save(self.store.as_ref());
        tracing::info!(username = %self.profile.username, "Upgraded to pro membership");
    }

    fn persist_profile(&self) {
        match serde_json::to_string(&self.profile) {
            Ok(json) => self.store.set(PROFILE_KEY, json),
            Err(e) => tracing::warn!(error = %e, "Failed to persist profile"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;

    const T0: u64 = 1_700_000_000_000;

    fn defaults() -> UserProfile {
        UserProfile::from_defaults(&ProfileDefaults::default())
    }

    #[test]
    fn defaults_come_from_config() {
        let profile = defaults();
        assert_eq!(profile.username, "Tony Stark");
        assert_eq!(profile.voice, "Zephyr");
        assert_eq!(profile.language, Language::En);
        assert!(!profile.is_pro_member);
    }

    #[test]
    fn saved_profile_merges_over_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set(PROFILE_KEY, r#"{"username":"Pepper","language":"es"}"#.into());
        let account = Account::load_at(store, defaults(), T0);
        assert_eq!(account.profile().username, "Pepper");
        assert_eq!(account.profile().language, Language::Es);
        assert_eq!(account.profile().voice, "Zephyr");
    }

    #[test]
    fn corrupt_profile_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set(PROFILE_KEY, "{not json".into());
        let account = Account::load_at(store, defaults(), T0);
        assert_eq!(account.profile(), &defaults());
    }

    #[test]
    fn login_flag_round_trips() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let account = Account::load_at(Arc::clone(&store), defaults(), T0);
        assert!(!account.is_logged_in());
        account.log_in();
        assert!(Account::load_at(store, defaults(), T0).is_logged_in());
    }

    #[test]
    fn pro_members_skip_quota() {
        let store = Arc::new(MemoryStore::new());
        let mut account = Account::load_at(store, defaults(), T0);
        for _ in 0..5 {
            account.authorize_uploads_at(1, T0).unwrap();
        }
        assert!(matches!(
            account.authorize_uploads_at(1, T0),
            Err(VoiceError::UploadLimitReached { .. })
        ));

        account.upgrade_to_pro();
        assert_eq!(account.uploads_remaining(), None);
        assert_eq!(account.quota().count(), 0);
        for _ in 0..10 {
            account.authorize_uploads_at(1, T0).unwrap();
        }
    }

    #[test]
    fn quota_survives_reload_within_window() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut account = Account::load_at(Arc::clone(&store), defaults(), T0);
        account.authorize_uploads_at(3, T0).unwrap();
        let reloaded = Account::load_at(store, defaults(), T0 + 60_000);
        assert_eq!(reloaded.uploads_remaining(), Some(2));
    }
}
