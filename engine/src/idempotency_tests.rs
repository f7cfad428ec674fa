//! Idempotency tests.
//!
//! These tests verify that re-submitting an operation under the same idempotency key returns the
//! first result without writing anything, whatever happened to the wallet in between.
//!
//! This is critical for at-least-once delivery of payment notifications and for client retries
//! after a timeout: a retry must never double-credit or double-lock.

#[cfg(test)]
mod tests {
    use crate::config::RateLimitConfig;
    use crate::mocks::{create_engine, create_funded_wallet, create_permissive_config, key};
    use crate::risk::Eligibility;
    use crate::{Completion, EngineError, NewBet};
    use futures::future::join_all;
    use wagerbook_types::{BetStatus, Currency, OperationType, OwnerId};

    #[tokio::test]
    async fn test_same_deposit_key_credits_once() {
        let t = create_engine(create_permissive_config());
        let wallet = create_funded_wallet(&t.engine, 1, 0).await;

        let first = t
            .engine
            .deposit(wallet.id, 500, key("dep-42"), Eligibility::Verified)
            .await
            .expect("first deposit should succeed");
        let second = t
            .engine
            .deposit(wallet.id, 500, key("dep-42"), Eligibility::Verified)
            .await
            .expect("replay should succeed");

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.get(), second.get());
        assert_eq!(t.engine.wallet(wallet.id).unwrap().available, 500);
        assert_eq!(t.engine.entries(wallet.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_returns_recorded_result_after_balance_moves() {
        let t = create_engine(create_permissive_config());
        let wallet = create_funded_wallet(&t.engine, 1, 0).await;

        t.engine
            .deposit(wallet.id, 500, key("d1"), Eligibility::Verified)
            .await
            .unwrap();
        t.engine
            .deposit(wallet.id, 300, key("d2"), Eligibility::Verified)
            .await
            .unwrap();

        let replay = t
            .engine
            .deposit(wallet.id, 500, key("d1"), Eligibility::Verified)
            .await
            .unwrap();
        let Completion::IdempotentReplay(change) = replay else {
            panic!("expected a replay");
        };
        assert_eq!(change.wallet.available, 500);
        assert_eq!(change.entries.len(), 1);
        assert_eq!(t.engine.wallet(wallet.id).unwrap().available, 800);
    }

    #[tokio::test]
    async fn test_key_reused_for_another_operation_conflicts() {
        let t = create_engine(create_permissive_config());
        let wallet = create_funded_wallet(&t.engine, 1, 1_000).await;

        t.engine
            .lock(wallet.id, 100, key("shared"))
            .await
            .unwrap();
        let err = t
            .engine
            .withdraw(wallet.id, 100, key("shared"), Eligibility::Verified)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::IdempotencyConflict {
                recorded: OperationType::Lock,
                requested: OperationType::Withdraw,
                ..
            }
        ));
        let after = t.engine.wallet(wallet.id).unwrap();
        assert_eq!((after.available, after.locked), (900, 100));
    }

    #[tokio::test]
    async fn test_key_reused_on_another_wallet_is_rejected() {
        let t = create_engine(create_permissive_config());
        let first = t.engine.ensure_wallet(OwnerId(1), Currency::USD).unwrap();
        let second = t.engine.ensure_wallet(OwnerId(2), Currency::USD).unwrap();

        t.engine
            .deposit(first.id, 500, key("dep-x"), Eligibility::Verified)
            .await
            .unwrap();
        let err = t
            .engine
            .deposit(second.id, 500, key("dep-x"), Eligibility::Verified)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::IdempotencyKeyReused {
                operation: OperationType::Deposit,
                ..
            }
        ));
        assert_eq!(t.engine.wallet(second.id).unwrap().available, 0);
        let outcomes = t.engine.metrics().outcomes;
        assert_eq!(outcomes.key_conflicts, 1);
        assert_eq!(outcomes.other_errors, 0);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_consume_key() {
        let t = create_engine(create_permissive_config());
        let wallet = create_funded_wallet(&t.engine, 1, 0).await;

        let err = t
            .engine
            .withdraw(wallet.id, 1_000, key("wd-1"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        t.engine
            .deposit(wallet.id, 2_000, key("top-up"), Eligibility::Verified)
            .await
            .unwrap();
        let retried = t
            .engine
            .withdraw(wallet.id, 1_000, key("wd-1"), Eligibility::Verified)
            .await
            .unwrap();
        assert!(!retried.is_replay());
        assert_eq!(retried.get().wallet.available, 1_000);
    }

    #[tokio::test]
    async fn test_replay_is_not_rate_limited() {
        let mut config = create_permissive_config();
        config.rate_limit = RateLimitConfig {
            max_operations: 1,
            window_ms: 60_000,
        };
        let t = create_engine(config);
        let wallet = t.engine.ensure_wallet(OwnerId(1), Currency::USD).unwrap();

        t.engine
            .deposit(wallet.id, 100, key("once"), Eligibility::Verified)
            .await
            .unwrap();
        let replay = t
            .engine
            .deposit(wallet.id, 100, key("once"), Eligibility::Verified)
            .await
            .unwrap();
        assert!(replay.is_replay());

        let err = t
            .engine
            .deposit(wallet.id, 100, key("twice"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited(id) if id == wallet.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_apply_once() {
        let t = create_engine(create_permissive_config());
        let wallet = create_funded_wallet(&t.engine, 1, 0).await;

        let attempts = (0..8).map(|_| {
            let engine = t.engine.clone();
            tokio::spawn(async move {
                engine
                    .deposit(wallet.id, 250, key("dup"), Eligibility::Verified)
                    .await
            })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.expect("task panicked").expect("deposit failed"))
            .collect();

        let applied = results.iter().filter(|c| !c.is_replay()).count();
        assert_eq!(applied, 1);
        assert_eq!(t.engine.wallet(wallet.id).unwrap().available, 250);
        assert_eq!(t.engine.entries(wallet.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bet_operations_replay() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let new = NewBet {
            creator: alice.id,
            title: "derby".to_string(),
            stake: 400,
            commission_bps: None,
            required_participants: None,
            acceptance_deadline: None,
            resolution_deadline: None,
        };

        let created = t.engine.create_bet(new.clone(), key("create")).await.unwrap();
        let again = t.engine.create_bet(new, key("create")).await.unwrap();
        assert!(again.is_replay());
        assert_eq!(created.get().bet.id, again.get().bet.id);
        assert_eq!(t.engine.escrow().bets_for_wallet(alice.id).unwrap().len(), 1);

        let bet = created.get().bet.id;
        let joined = t
            .engine
            .join_bet(bet, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
        assert_eq!(joined.get().bet.status, BetStatus::Accepted);
        let rejoined = t
            .engine
            .join_bet(bet, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
        assert!(rejoined.is_replay());

        let bob_after = t.engine.wallet(bob.id).unwrap();
        assert_eq!((bob_after.available, bob_after.locked), (600, 400));
        assert_eq!(t.engine.escrow().holds(bet).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bet_key_reused_on_another_bet_is_rejected() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let carol = create_funded_wallet(&t.engine, 3, 1_000).await;
        let new = |title: &str| NewBet {
            creator: alice.id,
            title: title.to_string(),
            stake: 100,
            commission_bps: None,
            required_participants: None,
            acceptance_deadline: None,
            resolution_deadline: None,
        };
        let first = t.engine.create_bet(new("first"), key("c1")).await.unwrap();
        let second = t.engine.create_bet(new("second"), key("c2")).await.unwrap();
        let (first, second) = (first.get().bet.id, second.get().bet.id);

        t.engine
            .join_bet(first, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
        let err = t
            .engine
            .join_bet(second, carol.id, key("join"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::IdempotencyKeyReused {
                operation: OperationType::JoinBet,
                ..
            }
        ));
        assert_eq!(t.engine.escrow().bet(second).unwrap().participants.len(), 1);
        assert_eq!(t.engine.wallet(carol.id).unwrap().locked, 0);

        t.engine
            .cancel_bet(first, alice.id, key("cancel"))
            .await
            .unwrap();
        let err = t
            .engine
            .cancel_bet(second, alice.id, key("cancel"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdempotencyKeyReused { .. }));
        assert_eq!(
            t.engine.escrow().bet(second).unwrap().status,
            BetStatus::Pending
        );
    }
}
