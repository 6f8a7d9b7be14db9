use std::sync::Arc;

use jarvis::config::ProfileDefaults;
use jarvis::profile::{Account, KeyValueStore, MemoryStore, UploadQuota, UserProfile, UPLOAD_WINDOW_MS};
use jarvis::VoiceError;

const T0: u64 = 1_750_000_000_000;

fn standard_account(store: Arc<dyn KeyValueStore>) -> Account {
    Account::load_at(store, UserProfile::from_defaults(&ProfileDefaults::default()), T0)
}

#[test]
fn sixth_upload_in_window_is_rejected() {
    let mut account = standard_account(Arc::new(MemoryStore::new()));
    for minute in 0..5 {
        account.authorize_uploads_at(1, T0 + minute * 60_000).unwrap();
    }
    assert_eq!(account.uploads_remaining(), Some(0));
    let err = account.authorize_uploads_at(1, T0 + 3_600_000).unwrap_err();
    assert!(matches!(err, VoiceError::UploadLimitReached { used: 5, limit: 5 }));
}

#[test]
fn counter_restarts_after_window() {
    let mut account = standard_account(Arc::new(MemoryStore::new()));
    for _ in 0..5 {
        account.authorize_uploads_at(1, T0).unwrap();
    }
    let after = T0 + UPLOAD_WINDOW_MS + 1;
    account.authorize_uploads_at(1, after).unwrap();
    assert_eq!(account.quota().count(), 1);
    assert_eq!(account.quota().first_upload_ms(), Some(after));
}

#[test]
fn quota_state_survives_account_reload() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut account = standard_account(Arc::clone(&store));
    account.authorize_uploads_at(5, T0).unwrap();

    let mut reloaded = standard_account(Arc::clone(&store));
    assert!(reloaded.authorize_uploads_at(1, T0 + 1).is_err());

    reloaded.upgrade_to_pro();
    let upgraded = standard_account(store);
    assert!(upgraded.profile().is_pro_member);
    assert_eq!(upgraded.uploads_remaining(), None);
}

#[test]
fn standalone_quota_with_custom_limits() {
    let mut quota = UploadQuota::with_limits(2, 1_000);
    assert_eq!(quota.try_consume_at(1, 0).unwrap(), 1);
    assert_eq!(quota.try_consume_at(1, 500).unwrap(), 0);
    assert!(quota.try_consume_at(1, 1_000).is_err());
    assert_eq!(quota.try_consume_at(1, 1_001).unwrap(), 1);
}
