use super::*;
use wagerbook_types::{BetOutcome, CommissionRate, Participant};

fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey::new(raw).unwrap()
}

fn funded(store: &MemoryStore, owner: u64, amount: MinorUnits) -> Wallet {
    let wallet = store
        .ensure_wallet(OwnerId(owner), Currency::USD, 0)
        .unwrap();
    if amount > 0 {
        store
            .commit(Batch::new(1).posting(Posting::new(
                wallet.id,
                EntryType::Deposit,
                amount,
                0,
            )))
            .unwrap();
    }
    store.wallet(wallet.id).unwrap().unwrap()
}

fn pending_bet(creator: WalletId) -> Bet {
    let stake = Amount::new(100).unwrap();
    Bet {
        id: BetId(0),
        creator,
        title: "coin".to_string(),
        currency: Currency::USD,
        stake,
        commission: CommissionRate::from_bps(500).unwrap(),
        required_participants: 2,
        participants: vec![Participant {
            wallet: creator,
            stake,
            joined_at: 0,
        }],
        status: BetStatus::Pending,
        outcome: BetOutcome::Undecided,
        created_at: 0,
        acceptance_deadline: None,
        resolution_deadline: None,
        resolved_at: None,
        version: 0,
    }
}

#[test]
fn test_batch_is_all_or_nothing() {
    let store = MemoryStore::new();
    let a = funded(&store, 1, 500);
    let b = funded(&store, 2, 50);

    // The second posting overdraws, so the first must not land either.
    let batch = Batch::new(2)
        .keyed(key("pair"), OperationType::Lock)
        .posting(Posting::new(a.id, EntryType::BetLock, -100, 100))
        .posting(Posting::new(b.id, EntryType::BetLock, -100, 100));
    let err = store.commit(batch).unwrap_err();
    assert!(matches!(
        err,
        StoreError::InsufficientFunds {
            bucket: Bucket::Available,
            requested: 100,
            available: 50,
            ..
        }
    ));

    assert_eq!(store.wallet(a.id).unwrap().unwrap().available, 500);
    assert_eq!(store.entries(a.id).unwrap().len(), 1);
    assert!(store.idempotency_record(&key("pair")).unwrap().is_none());
}

#[test]
fn test_replay_returns_recorded_receipt() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 0);

    let batch = Batch::new(3)
        .keyed(key("dep-42"), OperationType::Deposit)
        .posting(Posting::new(wallet.id, EntryType::Deposit, 250, 0));
    let first = store.commit(batch.clone()).unwrap();
    let second = store.commit(batch).unwrap();

    assert!(!first.is_replay());
    assert!(second.is_replay());
    assert_eq!(first.receipt(), second.receipt());
    assert_eq!(store.wallet(wallet.id).unwrap().unwrap().available, 250);
    assert_eq!(store.entries(wallet.id).unwrap().len(), 1);
}

#[test]
fn test_key_reuse_for_other_operation_conflicts() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    store
        .commit(
            Batch::new(2)
                .keyed(key("k"), OperationType::Withdraw)
                .posting(Posting::new(wallet.id, EntryType::Withdrawal, -10, 0)),
        )
        .unwrap();

    let err = store
        .commit(
            Batch::new(3)
                .keyed(key("k"), OperationType::Deposit)
                .posting(Posting::new(wallet.id, EntryType::Deposit, 10, 0)),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::IdempotencyConflict {
            recorded: OperationType::Withdraw,
            requested: OperationType::Deposit,
            ..
        }
    ));
}

#[test]
fn test_bucket_movement_has_zero_delta() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    let outcome = store
        .commit(Batch::new(2).posting(Posting::new(wallet.id, EntryType::BetLock, -700, 700)))
        .unwrap();

    let entry = &outcome.receipt().entries[0];
    assert_eq!(entry.delta, 0);
    assert_eq!(entry.resulting_available, 300);
    assert_eq!(entry.resulting_locked, 700);

    let wallet = store.wallet(wallet.id).unwrap().unwrap();
    assert_eq!(wallet.totals.wagered, 700);
    assert_eq!(wallet.version, 2);
}

#[test]
fn test_locked_bucket_cannot_go_negative() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    let err = store
        .commit(Batch::new(2).posting(Posting::new(wallet.id, EntryType::BetRelease, 1, -1)))
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InsufficientFunds {
            bucket: Bucket::Locked,
            ..
        }
    ));
}

#[test]
fn test_frozen_wallet_rejects_postings() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    store
        .set_wallet_status(
            wallet.id,
            WalletStatus::Frozen {
                reason: "manual".to_string(),
            },
            2,
        )
        .unwrap();
    let err = store
        .commit(Batch::new(3).posting(Posting::new(wallet.id, EntryType::Deposit, 1, 0)))
        .unwrap_err();
    assert!(matches!(err, StoreError::WalletFrozen { .. }));
}

#[test]
fn test_tampered_balances_are_detected_before_writing() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    store.tamper_balances(wallet.id, 9_000, 0);

    let err = store
        .commit(Batch::new(2).posting(Posting::new(wallet.id, EntryType::Withdrawal, -1, 0)))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation { .. }));
    assert_eq!(store.entries(wallet.id).unwrap().len(), 1);
}

#[test]
fn test_bet_insert_assigns_id_and_transition() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 0);
    let outcome = store
        .commit(Batch {
            bet: Some(BetWrite::Insert(pending_bet(wallet.id))),
            transition: Some(BetTransition {
                bet: BetId(0),
                from: None,
                to: BetStatus::Pending,
                actor: None,
                reason: None,
                at: 4,
            }),
            ..Batch::new(4)
        })
        .unwrap();

    let bet = outcome.receipt().bet.clone().unwrap();
    assert_ne!(bet.id, BetId(0));
    assert_eq!(bet.version, 1);
    let transitions = store.transitions(bet.id).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, BetStatus::Pending);
}

#[test]
fn test_stale_bet_update_is_rejected() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 0);
    let bet = store
        .commit(Batch {
            bet: Some(BetWrite::Insert(pending_bet(wallet.id))),
            ..Batch::new(1)
        })
        .unwrap()
        .receipt()
        .bet
        .clone()
        .unwrap();

    let mut cancelled = bet.clone();
    cancelled.status = BetStatus::Cancelled;
    let err = store
        .commit(Batch {
            bet: Some(BetWrite::Update {
                bet: cancelled,
                expected_version: bet.version + 1,
            }),
            ..Batch::new(2)
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleBet { .. }));
    assert_eq!(
        store.bet(bet.id).unwrap().unwrap().status,
        BetStatus::Pending
    );
}

#[test]
fn test_release_all_closes_open_holds() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 1_000);
    let bet = store
        .commit(Batch {
            bet: Some(BetWrite::Insert(pending_bet(wallet.id))),
            ..Batch::new(1)
        })
        .unwrap()
        .receipt()
        .bet
        .clone()
        .unwrap();

    store
        .commit(Batch {
            holds: HoldChange::Open(vec![NewHold {
                bet: bet.id,
                wallet: wallet.id,
                amount: bet.stake,
            }]),
            ..Batch::new(2).posting(
                Posting::new(wallet.id, EntryType::BetLock, -100, 100).for_bet(bet.id),
            )
        })
        .unwrap();
    assert!(store.holds(bet.id).unwrap()[0].is_open());

    let outcome = store
        .commit(Batch {
            holds: HoldChange::ReleaseAll(bet.id),
            ..Batch::new(3).posting(
                Posting::new(wallet.id, EntryType::BetRelease, 100, -100).for_bet(bet.id),
            )
        })
        .unwrap();
    assert_eq!(outcome.receipt().holds.len(), 1);
    assert!(store.holds(bet.id).unwrap().iter().all(|h| !h.is_open()));
}

#[test]
fn test_bets_due_respects_status_and_deadlines() {
    let store = MemoryStore::new();
    let wallet = funded(&store, 1, 0);
    let mut expiring = pending_bet(wallet.id);
    expiring.acceptance_deadline = Some(100);
    let mut open_ended = pending_bet(wallet.id);
    open_ended.acceptance_deadline = None;
    for bet in [expiring, open_ended] {
        store
            .commit(Batch {
                bet: Some(BetWrite::Insert(bet)),
                ..Batch::new(1)
            })
            .unwrap();
    }

    assert!(store.bets_due(99).unwrap().is_empty());
    let due = store.bets_due(100).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].acceptance_deadline, Some(100));
}
