// SPDX-License-Identifier: Apache-2.0
//! A token minted with a 1-second TTL: still fresh at 0.5s, expired-but-
//! resolvable at 1.5s, and gone entirely past its 2x-TTL horizon at 2.5s.

use std::time::Duration;

use fabric_service::tokens::MarshalTokenRegistry;

#[tokio::test]
async fn token_lifecycle_matches_ttl_then_double_ttl_horizon() {
    let mut registry = MarshalTokenRegistry::new();
    let token = registry.mint("stg-expiry-demo", Duration::from_secs(1), "cli", "alice", "agent-1");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let view = registry.resolve(&token).expect("token should resolve at 0.5s");
    assert!(!view.expired, "token should still be fresh at 0.5s against a 1s ttl");
    assert!(view.remaining_secs > 0.0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let view = registry.resolve(&token).expect("token should still resolve at 1.5s, past ttl but under 2x ttl");
    assert!(view.expired, "token should be reported expired past its ttl");
    assert_eq!(view.remaining_secs, 0.0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(registry.resolve(&token).is_some(), "purge only happens on mint, so a stale read still resolves");
    registry.mint("stg-unrelated", Duration::from_secs(60), "cli", "bob", "agent-2");
    assert!(registry.resolve(&token).is_none(), "token past 2x ttl should be purged once any mint runs");
}
