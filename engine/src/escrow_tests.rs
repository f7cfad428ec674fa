//! Bet lifecycle tests.
//!
//! Each test drives a bet through the engine end to end and checks the balances, the escrow
//! holds, and the audit trail that the lifecycle leaves behind.

#[cfg(test)]
mod tests {
    use crate::config::AcceptFailurePolicy;
    use crate::mocks::{
        create_engine, create_funded_wallet, create_permissive_config, key, MemoryStore,
    };
    use crate::risk::Eligibility;
    use crate::{Adjudication, Engine, EngineError, NewBet};
    use wagerbook_types::{
        BetId, BetOutcome, BetStatus, Currency, OwnerId, Wallet, WalletId, WalletStatus,
    };

    fn new_bet(creator: WalletId, stake: i64) -> NewBet {
        NewBet {
            creator,
            title: "who wins the derby".to_string(),
            stake,
            commission_bps: None,
            required_participants: None,
            acceptance_deadline: None,
            resolution_deadline: None,
        }
    }

    fn platform(engine: &Engine<MemoryStore>) -> Wallet {
        engine
            .wallet_by_owner(OwnerId(0), Currency::USD)
            .unwrap()
            .expect("platform wallet exists")
    }

    fn balances(engine: &Engine<MemoryStore>, wallet: WalletId) -> (i64, i64) {
        let wallet = engine.wallet(wallet).unwrap();
        (wallet.available, wallet.locked)
    }

    /// Creates a two-party bet between fresh wallets and accepts it.
    async fn accepted_bet(
        engine: &Engine<MemoryStore>,
        funds: i64,
        stake: i64,
    ) -> (BetId, Wallet, Wallet) {
        let alice = create_funded_wallet(engine, 1, funds).await;
        let bob = create_funded_wallet(engine, 2, funds).await;
        let bet = engine
            .create_bet(new_bet(alice.id, stake), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;
        let joined = engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
        assert_eq!(joined.get().bet.status, BetStatus::Accepted);
        (bet.id, alice, bob)
    }

    #[tokio::test]
    async fn test_winner_takes_pot_minus_commission() {
        let t = create_engine(create_permissive_config());
        let (bet, alice, bob) = accepted_bet(&t.engine, 20_000, 10_000).await;
        assert_eq!(balances(&t.engine, alice.id), (10_000, 10_000));
        assert_eq!(t.engine.escrow().holds(bet).unwrap().len(), 2);

        let resolved = t
            .engine
            .resolve_bet(bet, BetOutcome::Winner(alice.id), "oracle", key("resolve"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resolved.bet.status, BetStatus::Resolved);
        assert_eq!(resolved.bet.outcome, BetOutcome::Winner(alice.id));
        assert_eq!(balances(&t.engine, alice.id), (29_000, 0));
        assert_eq!(balances(&t.engine, bob.id), (10_000, 0));
        assert_eq!(platform(&t.engine).available, 1_000);
        let holds = t.engine.escrow().holds(bet).unwrap();
        assert!(holds.iter().all(|hold| !hold.is_open()));

        let metrics = t.engine.metrics();
        assert_eq!(metrics.bets_settled, 1);
        assert_eq!(metrics.commission_collected, 1_000);
        for wallet in [alice.id, bob.id, platform(&t.engine).id] {
            assert!(t.engine.reconcile_wallet(wallet).unwrap().is_consistent());
        }
    }

    #[tokio::test]
    async fn test_cancel_after_acceptance_refunds_stakes() {
        let t = create_engine(create_permissive_config());
        let (bet, alice, bob) = accepted_bet(&t.engine, 20_000, 10_000).await;

        let cancelled = t
            .engine
            .cancel_bet(bet, alice.id, key("cancel"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(cancelled.bet.status, BetStatus::Refunded);
        assert_eq!(balances(&t.engine, alice.id), (20_000, 0));
        assert_eq!(balances(&t.engine, bob.id), (20_000, 0));
        assert_eq!(platform(&t.engine).available, 0);
        assert_eq!(t.engine.metrics().commission_collected, 0);
        assert_eq!(t.engine.metrics().bets_refunded, 1);
    }

    #[tokio::test]
    async fn test_only_creator_may_cancel() {
        let t = create_engine(create_permissive_config());
        let (bet, _alice, bob) = accepted_bet(&t.engine, 1_000, 100).await;

        let err = t
            .engine
            .cancel_bet(bet, bob.id, key("cancel"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
        assert_eq!(t.engine.escrow().bet(bet).unwrap().status, BetStatus::Accepted);
    }

    #[tokio::test]
    async fn test_cancel_pending_bet_moves_no_funds() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bet = t
            .engine
            .create_bet(new_bet(alice.id, 100), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        let cancelled = t
            .engine
            .cancel_bet(bet.id, alice.id, key("cancel"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(cancelled.bet.status, BetStatus::Cancelled);
        assert!(cancelled.entries.is_empty());
        assert_eq!(balances(&t.engine, alice.id), (1_000, 0));

        let transitions = t.engine.escrow().transitions(bet.id).unwrap();
        let path: Vec<_> = transitions.iter().map(|tr| (tr.from, tr.to)).collect();
        assert_eq!(
            path,
            vec![
                (None, BetStatus::Pending),
                (Some(BetStatus::Pending), BetStatus::Cancelled)
            ]
        );
    }

    #[tokio::test]
    async fn test_push_returns_every_stake() {
        let t = create_engine(create_permissive_config());
        let (bet, alice, bob) = accepted_bet(&t.engine, 1_000, 400).await;
        t.engine
            .activate_bet(bet, bob.id, key("activate"))
            .await
            .unwrap();

        let resolved = t
            .engine
            .resolve_bet(bet, BetOutcome::Push, "oracle", key("resolve"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resolved.bet.status, BetStatus::Resolved);
        assert_eq!(resolved.bet.outcome, BetOutcome::Push);
        assert_eq!(balances(&t.engine, alice.id), (1_000, 0));
        assert_eq!(balances(&t.engine, bob.id), (1_000, 0));
        assert_eq!(platform(&t.engine).available, 0);
    }

    #[tokio::test]
    async fn test_resolving_pending_bet_conflicts() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bet = t
            .engine
            .create_bet(new_bet(alice.id, 100), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        let err = t
            .engine
            .resolve_bet(bet.id, BetOutcome::Winner(alice.id), "oracle", key("resolve"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BetStateConflict {
                status: BetStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_winner_must_be_participant() {
        let t = create_engine(create_permissive_config());
        let (bet, _alice, _bob) = accepted_bet(&t.engine, 1_000, 100).await;
        let outsider = create_funded_wallet(&t.engine, 3, 0).await;

        let err = t
            .engine
            .resolve_bet(bet, BetOutcome::Winner(outsider.id), "oracle", key("resolve"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBet(_)));
        assert_eq!(t.engine.escrow().bet(bet).unwrap().status, BetStatus::Accepted);
    }

    #[tokio::test]
    async fn test_dispute_then_adjudicate() {
        let t = create_engine(create_permissive_config());
        let (bet, alice, bob) = accepted_bet(&t.engine, 1_000, 500).await;

        let disputed = t
            .engine
            .dispute_bet(bet, alice.id, "result was fixed".to_string(), key("dispute"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(disputed.bet.status, BetStatus::Disputed);

        let err = t
            .engine
            .resolve_bet(bet, BetOutcome::Winner(alice.id), "oracle", key("resolve"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BetStateConflict { .. }));

        let err = t
            .engine
            .adjudicate_bet(bet, "mallory", Adjudication::Winner(alice.id), key("adj-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let adjudicated = t
            .engine
            .adjudicate_bet(bet, "ops", Adjudication::Winner(bob.id), key("adj-2"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(adjudicated.bet.status, BetStatus::Resolved);
        // 1000 pot at 5% commission.
        assert_eq!(balances(&t.engine, bob.id), (1_450, 0));
        assert_eq!(balances(&t.engine, alice.id), (500, 0));
        assert_eq!(platform(&t.engine).available, 50);
    }

    #[tokio::test]
    async fn test_failed_acceptance_reverts_to_pending() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 50).await;
        let bet = t
            .engine
            .create_bet(new_bet(alice.id, 100), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        let err = t
            .engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        let current = t.engine.escrow().bet(bet.id).unwrap();
        assert_eq!(current.status, BetStatus::Pending);
        assert_eq!(current.participants.len(), 1);
        assert_eq!(balances(&t.engine, alice.id), (1_000, 0));
        assert!(t.engine.escrow().holds(bet.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_acceptance_cancels_under_cancel_policy() {
        let mut config = create_permissive_config();
        config.betting.on_accept_failure = AcceptFailurePolicy::Cancel;
        let t = create_engine(config);
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 50).await;
        let bet = t
            .engine
            .create_bet(new_bet(alice.id, 100), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        t.engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert_eq!(
            t.engine.escrow().bet(bet.id).unwrap().status,
            BetStatus::Cancelled
        );
        assert_eq!(balances(&t.engine, alice.id), (1_000, 0));
    }

    #[tokio::test]
    async fn test_three_way_bet_locks_on_last_join() {
        let t = create_engine(create_permissive_config());
        let wallets = [
            create_funded_wallet(&t.engine, 1, 300).await,
            create_funded_wallet(&t.engine, 2, 300).await,
            create_funded_wallet(&t.engine, 3, 300).await,
        ];
        let mut new = new_bet(wallets[0].id, 300);
        new.commission_bps = Some(0);
        new.required_participants = Some(3);
        let bet = t
            .engine
            .create_bet(new, key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        let second = t
            .engine
            .join_bet(bet.id, wallets[1].id, key("join-1"), Eligibility::Verified)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(second.bet.status, BetStatus::Pending);
        assert_eq!(balances(&t.engine, wallets[0].id), (300, 0));

        let third = t
            .engine
            .join_bet(bet.id, wallets[2].id, key("join-2"), Eligibility::Verified)
            .await
            .unwrap()
            .into_inner();
        assert_eq!(third.bet.status, BetStatus::Accepted);
        for wallet in &wallets {
            assert_eq!(balances(&t.engine, wallet.id), (0, 300));
        }

        t.engine
            .resolve_bet(bet.id, BetOutcome::Winner(wallets[2].id), "oracle", key("resolve"))
            .await
            .unwrap();
        assert_eq!(balances(&t.engine, wallets[2].id), (900, 0));
        assert_eq!(platform(&t.engine).available, 0);
    }

    #[tokio::test]
    async fn test_sweep_closes_elapsed_bets() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let now = t.engine.now();

        let mut stale = new_bet(alice.id, 100);
        stale.acceptance_deadline = Some(now + 100);
        let stale = t
            .engine
            .create_bet(stale, key("stale"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        let mut overdue = new_bet(alice.id, 200);
        overdue.resolution_deadline = Some(now + 500);
        let overdue = t
            .engine
            .create_bet(overdue, key("overdue"))
            .await
            .unwrap()
            .into_inner()
            .bet;
        t.engine
            .join_bet(overdue.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();

        t.clock.advance(200);
        let report = t.engine.expire_due().await.unwrap();
        assert_eq!(report.cancelled, vec![stale.id]);
        assert!(report.expired.is_empty());

        t.clock.advance(400);
        let report = t.engine.expire_due().await.unwrap();
        assert_eq!(report.expired, vec![overdue.id]);
        assert_eq!(
            t.engine.escrow().bet(overdue.id).unwrap().status,
            BetStatus::Expired
        );
        assert_eq!(balances(&t.engine, alice.id), (1_000, 0));
        assert_eq!(balances(&t.engine, bob.id), (1_000, 0));

        assert!(t.engine.expire_due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disputed_bets_are_not_swept() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let mut new = new_bet(alice.id, 100);
        new.resolution_deadline = Some(t.engine.now() + 100);
        let bet = t
            .engine
            .create_bet(new, key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;
        t.engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
        t.engine
            .dispute_bet(bet.id, bob.id, "late".to_string(), key("dispute"))
            .await
            .unwrap();

        t.clock.advance(1_000);
        assert!(t.engine.expire_due().await.unwrap().is_empty());
        assert_eq!(balances(&t.engine, bob.id), (900, 100));
    }

    #[tokio::test]
    async fn test_join_after_deadline_is_rejected() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let mut new = new_bet(alice.id, 100);
        new.acceptance_deadline = Some(t.engine.now() + 10);
        let bet = t
            .engine
            .create_bet(new, key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        t.clock.advance(10);
        let err = t
            .engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBet(_)));
    }

    #[tokio::test]
    async fn test_stake_outside_limits_is_rejected() {
        let mut config = create_permissive_config();
        config.betting.min_stake = 100;
        let t = create_engine(config);
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;

        let err = t
            .engine
            .create_bet(new_bet(alice.id, 50), key("create"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBet(_)));
        assert!(t.engine.escrow().open_bets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frozen_wallet_cannot_join_until_unfrozen() {
        let t = create_engine(create_permissive_config());
        let alice = create_funded_wallet(&t.engine, 1, 1_000).await;
        let bob = create_funded_wallet(&t.engine, 2, 1_000).await;
        let bet = t
            .engine
            .create_bet(new_bet(alice.id, 100), key("create"))
            .await
            .unwrap()
            .into_inner()
            .bet;

        t.store.tamper_balances(bob.id, 5_000, 0);
        let err = t
            .engine
            .deposit(bob.id, 10, key("dep"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
        assert!(t.engine.wallet(bob.id).unwrap().status.is_frozen());

        let err = t
            .engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WalletFrozen { .. }));
        assert!(t.engine.unfreeze_wallet(bob.id).await.is_err());

        t.store.tamper_balances(bob.id, 1_000, 0);
        let wallet = t.engine.unfreeze_wallet(bob.id).await.unwrap();
        assert_eq!(wallet.status, WalletStatus::Active);
        t.engine
            .join_bet(bet.id, bob.id, key("join"), Eligibility::Verified)
            .await
            .unwrap();
    }
}
