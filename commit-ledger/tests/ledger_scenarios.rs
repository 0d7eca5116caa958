//! End-to-end ledger scenarios through the async API

use commit_ledger::{
    codec::WireFormat, storage::WithdrawalFilter, Address, Amount, Approval, AssetAmount, Config,
    Digest, Error, Fill, Intent, L2Order, Ledger, Proof, Round, WithdrawalRequest,
    WithdrawalStatus,
};
use tempfile::TempDir;
use uuid::Uuid;

const OPERATOR: Address = Address::new([0xff; 20]);
const USD: Address = Address::new([0x01; 20]);
const BTC: Address = Address::new([0x02; 20]);
const ALICE: Address = Address::new([0xa1; 20]);
const BOB: Address = Address::new([0xb0; 20]);
const CAROL: Address = Address::new([0xc0; 20]);

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.operator = OPERATOR;
    config.assets = vec![USD, BTC];
    config
}

async fn create_test_ledger() -> (TempDir, Ledger) {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(test_config(&dir)).await.unwrap();
    (dir, ledger)
}

fn approval(owner: Address, sell: Amount, buy: Amount, round: Round) -> Approval {
    Approval {
        approval_id: Uuid::new_v4(),
        round,
        buy: AssetAmount { asset: BTC, amount: buy },
        sell: AssetAmount { asset: USD, amount: sell },
        intent: Intent::BuyAll,
        owner,
        instance_id: OPERATOR,
    }
}

fn fill_for(approval: &Approval, sell: Amount, buy: Amount) -> Fill {
    Fill {
        fill_id: Uuid::new_v4(),
        approval_id: approval.approval_id,
        round: approval.round,
        buy_amount: buy,
        buy_asset: approval.buy.asset,
        sell_amount: sell,
        sell_asset: approval.sell.asset,
        client_address: approval.owner,
        instance_id: approval.instance_id,
    }
}

fn withdrawal(tx: u8, wallet: Address, amount: Amount) -> WithdrawalRequest {
    WithdrawalRequest {
        id: Uuid::new_v4(),
        tx_hash: Digest::new([tx; 32]),
        asset: USD,
        wallet,
        amount,
        round: 0,
    }
}

/// Asserts the call is rejected and the full state dump is unchanged
macro_rules! assert_rejected_unchanged {
    ($ledger:expr, $call:expr, $pattern:pat) => {{
        let before = $ledger.to_json().unwrap();
        let result = $call.await;
        assert!(matches!(result, Err($pattern)), "unexpected result: {:?}", result);
        assert_eq!($ledger.to_json().unwrap(), before);
        result.unwrap_err()
    }};
}

#[tokio::test]
async fn test_opening_balance_carries_forward() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 100, 0).await.unwrap();

    assert_eq!(ledger.opening_balance(&USD, &ALICE, 2).unwrap(), 100);
    assert_eq!(ledger.balance(&USD, &ALICE, 2).unwrap(), 100);
    assert_eq!(ledger.opening_balance(&USD, &ALICE, 0).unwrap(), 0);
    assert_eq!(ledger.balance(&USD, &ALICE, 1_000_000).unwrap(), 100);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let (_dir, ledger) = create_test_ledger().await;
    assert!(ledger.register(ALICE, 0).await.unwrap());
    ledger.credit_deposit(USD, ALICE, 1, 0).await.unwrap();

    assert!(!ledger.register(ALICE, 4).await.unwrap());
    assert_eq!(ledger.balance(&USD, &ALICE, 0).unwrap(), 1);
    let joined = ledger.wallets().unwrap().into_iter().find(|w| w.address == ALICE).unwrap();
    assert_eq!(joined.round_joined, 0);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejections_leave_state_unchanged() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.register(BOB, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();

    // deposits
    assert_rejected_unchanged!(ledger, ledger.credit_deposit(USD, ALICE, 0, 0), Error::InvalidAmount { .. });
    assert_rejected_unchanged!(ledger, ledger.credit_deposit(USD, ALICE, -5, 0), Error::InvalidAmount { .. });
    assert_rejected_unchanged!(ledger, ledger.credit_deposit(USD, CAROL, 5, 0), Error::NotRegistered(_));
    assert_rejected_unchanged!(
        ledger,
        ledger.credit_deposit(Address::new([0x09; 20]), ALICE, 5, 0),
        Error::UnknownAsset(_)
    );

    // approvals
    let err = assert_rejected_unchanged!(
        ledger,
        ledger.insert_approval(approval(ALICE, 11, 1, 0)),
        Error::InsufficientBalance { .. }
    );
    assert_eq!(
        err.to_string(),
        format!("Insufficient balance of {}: available 10, requested 11", USD)
    );

    let mut unknown_asset = approval(ALICE, 5, 1, 0);
    unknown_asset.buy.asset = Address::new([0x09; 20]);
    assert_rejected_unchanged!(ledger, ledger.insert_approval(unknown_asset), Error::AssetMismatch(_));
    assert_rejected_unchanged!(ledger, ledger.insert_approval(approval(CAROL, 5, 1, 0)), Error::NotRegistered(_));

    let open = approval(ALICE, 5, 1, 0);
    ledger.insert_approval(open.clone()).await.unwrap();
    assert_rejected_unchanged!(ledger, ledger.insert_approval(open.clone()), Error::AlreadyExists(_));

    // fills
    let unbacked = fill_for(&approval(ALICE, 5, 1, 0), 1, 1);
    let err = assert_rejected_unchanged!(ledger, ledger.insert_fill(unbacked), Error::UnbackedFill { .. });
    assert!(err.to_string().contains("not backed by an approval"));

    let mut wrong_asset = fill_for(&open, 1, 1);
    wrong_asset.sell_asset = BTC;
    assert_rejected_unchanged!(ledger, ledger.insert_fill(wrong_asset), Error::AssetMismatch(_));

    let mut wrong_instance = fill_for(&open, 1, 1);
    wrong_instance.instance_id = ALICE;
    assert_rejected_unchanged!(ledger, ledger.insert_fill(wrong_instance), Error::InstanceMismatch(_));

    let mut wrong_wallet = fill_for(&open, 1, 1);
    wrong_wallet.client_address = BOB;
    let err = assert_rejected_unchanged!(ledger, ledger.insert_fill(wrong_wallet), Error::WalletMismatch(_));
    assert!(err.to_string().contains(&BOB.to_string()));
    assert!(err.to_string().contains(&ALICE.to_string()));

    assert_rejected_unchanged!(ledger, ledger.insert_fill(fill_for(&open, 1, 2)), Error::ExceedsApproved { .. });

    // withdrawals
    assert_rejected_unchanged!(ledger, ledger.withdraw(withdrawal(1, ALICE, 0)), Error::InvalidAmount { .. });
    assert_rejected_unchanged!(ledger, ledger.withdraw(withdrawal(1, ALICE, 6)), Error::InsufficientBalance { .. });
    assert_rejected_unchanged!(ledger, ledger.confirm_withdrawal(Digest::new([1; 32])), Error::NoPendingWithdrawal(_));
    assert_rejected_unchanged!(ledger, ledger.cancel_withdrawal(Digest::new([1; 32])), Error::NoWithdrawalToCancel(_));

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_approval_twice() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();

    let open = approval(ALICE, 6, 1, 0);
    ledger.insert_approval(open.clone()).await.unwrap();
    assert_eq!(ledger.locked(&USD, &ALICE, 0).unwrap(), 6);
    assert_eq!(ledger.balance(&USD, &ALICE, 0).unwrap(), 4);

    ledger.cancel_approval(open.approval_id).await.unwrap();
    assert_eq!(ledger.locked(&USD, &ALICE, 0).unwrap(), 0);
    assert_eq!(ledger.balance(&USD, &ALICE, 0).unwrap(), 10);

    let err = assert_rejected_unchanged!(ledger, ledger.cancel_approval(open.approval_id), Error::AlreadyClosed(_));
    assert!(err.to_string().contains("already closed"));

    let err = assert_rejected_unchanged!(ledger, ledger.insert_fill(fill_for(&open, 1, 1)), Error::AlreadyClosed(_));
    assert!(err.is_validation());

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_order_inserted_all_or_nothing() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();

    // the fee approval needs 3 more than what the order approval leaves
    let rejected = L2Order {
        order_approval: approval(ALICE, 8, 1, 0),
        fee_approval: approval(ALICE, 5, 1, 0),
    };
    assert_rejected_unchanged!(ledger, ledger.insert_order(rejected.clone()), Error::InsufficientBalance { .. });
    assert!(ledger.approval(&rejected.order_approval.approval_id).unwrap_err().is_not_found());
    assert_eq!(ledger.locked(&USD, &ALICE, 0).unwrap(), 0);

    let accepted = L2Order {
        order_approval: approval(ALICE, 8, 1, 0),
        fee_approval: approval(ALICE, 2, 1, 0),
    };
    ledger.insert_order(accepted.clone()).await.unwrap();
    assert!(ledger.approval(&accepted.order_approval.approval_id).is_ok());
    assert!(ledger.approval(&accepted.fee_approval.approval_id).is_ok());
    assert_eq!(ledger.locked(&USD, &ALICE, 0).unwrap(), 10);
    assert_eq!(ledger.balance(&USD, &ALICE, 0).unwrap(), 0);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_withdrawal_exclusivity() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();

    ledger.withdraw(withdrawal(1, ALICE, 3)).await.unwrap();
    let err = assert_rejected_unchanged!(
        ledger,
        ledger.withdraw(withdrawal(2, ALICE, 3)),
        Error::DoubleWithdrawal { .. }
    );
    assert!(err.to_string().contains("already outstanding"));

    ledger.confirm_withdrawal(Digest::new([1; 32])).await.unwrap();
    ledger.withdraw(withdrawal(2, ALICE, 3)).await.unwrap();
    ledger.cancel_withdrawal(Digest::new([2; 32])).await.unwrap();
    ledger.withdraw(withdrawal(3, ALICE, 7)).await.unwrap();

    assert_eq!(ledger.balance(&USD, &ALICE, 0).unwrap(), 0);
    assert_eq!(ledger.account(&USD, &ALICE, 0).unwrap().withdrawn, 10);

    // reusing a settled transaction hash is a duplicate
    assert_rejected_unchanged!(ledger, ledger.withdraw(withdrawal(1, BOB, 1)), Error::AlreadyExists(_));

    let confirmed = ledger
        .withdrawals(&WithdrawalFilter {
            wallet: Some(ALICE),
            status: Some(WithdrawalStatus::Confirmed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].request.tx_hash, Digest::new([1; 32]));
    assert_eq!(ledger.withdrawals(&WithdrawalFilter::default()).unwrap().len(), 3);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_solvency_commit_scenario() {
    let (_dir, ledger) = create_test_ledger().await;
    for wallet in [ALICE, BOB, CAROL] {
        ledger.register(wallet, 0).await.unwrap();
    }
    ledger.credit_deposit(BTC, ALICE, 2, 0).await.unwrap();

    let tree = ledger.solvency_tree(BTC, 1).await.unwrap();
    assert_eq!(tree.height(), 3);
    assert_eq!(tree.width(), 4);
    assert_eq!(tree.root().unwrap().sum, 2);

    let padded = tree.root_with_padding().unwrap();
    let again = ledger.solvency_tree(BTC, 1).await.unwrap();
    assert_eq!(again.root_with_padding().unwrap(), padded);

    let proof = ledger.complete_proof(BTC, ALICE, 1).await.unwrap();
    assert_eq!(proof.client_opening_balance, 2);
    assert_eq!(proof.liabilities.len(), 2);
    assert_eq!(proof.liabilities.iter().map(|l| l.sum).collect::<Vec<_>>(), vec![0, 0]);
    assert!(proof.verify_commitment(&padded));

    let commit = ledger.commit_round(BTC, 1).await.unwrap();
    assert_eq!(commit.padded_root, padded);
    assert_eq!(commit.root.height, 3);
    assert_eq!(commit.root.width, 4);
    assert_eq!(ledger.commitment(&BTC, 1).unwrap(), commit);
    assert_eq!(ledger.stored_proof(&BTC, &ALICE, 1).unwrap(), proof);

    let wire = proof.to_wire_json().unwrap();
    assert_eq!(Proof::from_wire_json(&wire).unwrap(), proof);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fill_against_approval() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 10, 0).await.unwrap();

    let round = 0;
    let open = approval(ALICE, 10, 1, round);
    ledger.insert_approval(open.clone()).await.unwrap();
    ledger.insert_fill(fill_for(&open, 10, 1)).await.unwrap();

    assert_eq!(ledger.locked(&USD, &ALICE, round).unwrap(), 0);
    assert_eq!(ledger.balance(&USD, &ALICE, round).unwrap(), 0);
    for later in round + 1..=round + 10 {
        assert_eq!(ledger.opening_balance(&USD, &ALICE, later).unwrap(), 0);
        assert_eq!(ledger.balance(&USD, &ALICE, later).unwrap(), 0);
        assert_eq!(ledger.locked(&USD, &ALICE, later).unwrap(), 0);
        assert_eq!(ledger.opening_balance(&BTC, &ALICE, later).unwrap(), 1);
    }

    let record = ledger.account(&USD, &ALICE, round).unwrap();
    assert_eq!(record.sold, 10);
    assert_eq!(ledger.account(&BTC, &ALICE, round).unwrap().bought, 1);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_proof_stable_across_later_joiner() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 4, 0).await.unwrap();

    let first = ledger.complete_proof(USD, ALICE, 1).await.unwrap();

    ledger.register(BOB, 1).await.unwrap();
    ledger.credit_deposit(USD, BOB, 9, 1).await.unwrap();

    let second = ledger.complete_proof(USD, ALICE, 1).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_wire_json().unwrap(), second.to_wire_json().unwrap());

    // bob shows up from round 2 on
    let round2 = ledger.solvency_tree(USD, 2).await.unwrap();
    assert_eq!(round2.width(), 3);
    assert_eq!(round2.root().unwrap().sum, 13);
    let err = ledger.complete_proof(USD, BOB, 1).await.unwrap_err();
    assert!(err.is_not_found());

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let ledger = Ledger::open(config.clone()).await.unwrap();
    ledger.register(ALICE, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, 42, 0).await.unwrap();
    let dump = ledger.to_json().unwrap();
    ledger.shutdown().await.unwrap();

    let reopened = Ledger::open(config).await.unwrap();
    assert_eq!(reopened.to_json().unwrap(), dump);
    assert_eq!(reopened.balance(&USD, &ALICE, 3).unwrap(), 42);
    reopened.shutdown().await.unwrap();
}

#[test]
fn test_acknowledged_writes_survive_crash() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.rocksdb.flush_on_shutdown = false;

    {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = Ledger::open(config.clone()).await.unwrap();
            ledger.register(ALICE, 0).await.unwrap();
            ledger.credit_deposit(USD, ALICE, 42, 0).await.unwrap();
            // Dropped without flush or shutdown
        });
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let reopened = Ledger::open(config).await.unwrap();
        assert!(reopened.is_registered(&ALICE).unwrap());
        assert_eq!(reopened.balance(&USD, &ALICE, 0).unwrap(), 42);
        assert_eq!(reopened.opening_balance(&USD, &ALICE, 1).unwrap(), 42);
        reopened.shutdown().await.unwrap();
    });
}

#[tokio::test]
async fn test_overflowing_deposit_rejected() {
    let (_dir, ledger) = create_test_ledger().await;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.register(BOB, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, Amount::MAX, 0).await.unwrap();

    let err = assert_rejected_unchanged!(
        ledger,
        ledger.credit_deposit(USD, ALICE, 1, 0),
        Error::AmountOverflow(_)
    );
    assert!(err.is_validation());

    ledger.credit_deposit(USD, BOB, 5, 0).await.unwrap();
    assert_eq!(ledger.balance(&USD, &BOB, 0).unwrap(), 5);
    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overflowing_tree_sum_rejected() {
    let (_dir, ledger) = create_test_ledger().await;
    let half = Amount::MAX / 2 + 10;
    ledger.register(ALICE, 0).await.unwrap();
    ledger.register(BOB, 0).await.unwrap();
    ledger.credit_deposit(USD, ALICE, half, 0).await.unwrap();
    ledger.credit_deposit(USD, BOB, half, 0).await.unwrap();

    let err = ledger.commit_round(USD, 1).await.unwrap_err();
    assert!(err.is_invariant_violation());
    assert!(ledger.commitment(&USD, 1).unwrap_err().is_not_found());
    ledger.shutdown().await.unwrap();
}
