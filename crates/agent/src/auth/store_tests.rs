// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn claims_for(sub: &str) -> Claims {
    Claims {
        sub: sub.to_owned(),
        workspace: Some("ws-abc123".to_owned()),
        node: None,
        token_type: None,
        aud: None,
        exp: u64::MAX,
    }
}

#[tokio::test]
async fn create_and_get() {
    let store = SessionStore::new(Duration::from_secs(60), 8);
    let id = store.create(claims_for("u1")).await;

    let claims = store.get(&id).await;
    assert_eq!(claims.map(|c| c.sub), Some("u1".to_owned()));
    assert!(store.get("nope").await.is_none());
}

#[tokio::test]
async fn expired_sessions_are_invisible_and_purged() {
    let store = SessionStore::new(Duration::from_millis(20), 8);
    let id = store.create(claims_for("u1")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get(&id).await.is_none());

    assert_eq!(store.purge_expired().await, 1);
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn lru_evicts_oldest_untouched() {
    let store = SessionStore::new(Duration::from_secs(60), 2);
    let first = store.create(claims_for("u1")).await;
    let second = store.create(claims_for("u2")).await;

    // Touch the first so the second becomes the eviction candidate.
    assert!(store.get(&first).await.is_some());
    let _third = store.create(claims_for("u3")).await;

    assert_eq!(store.len().await, 2);
    assert!(store.get(&first).await.is_some());
    assert!(store.get(&second).await.is_none());
}

#[tokio::test]
async fn remove_is_idempotent() {
    let store = SessionStore::new(Duration::from_secs(60), 8);
    let id = store.create(claims_for("u1")).await;
    store.remove(&id).await;
    store.remove(&id).await;
    assert!(store.get(&id).await.is_none());
}
