//! End-to-end donation reconciliation scenarios against a scripted chain.

use crate::app::AppState;
use crate::config::Network;
use crate::db;
use crate::errors::{AppError, ChainError, ReconciliationError, StateError};
use crate::events::encode;
use crate::models::{CampaignStatus, DonationClaim, DonationStatus};
use crate::reconciler::{reconcile, reverse, submit_claim};
use crate::test_support::{
    admin, donor, insert_active_campaign, setup_state, tx_hash, FakeGateway, DONATION_CONTRACT,
    DONOR_ADDRESS, OWNER, UNIT,
};

fn claim(campaign_id: i64, amount: f64, hash: &str) -> DonationClaim {
    DonationClaim {
        campaign_id,
        amount,
        transaction_hash: hash.to_string(),
        network: Network::Polygon,
        currency: "MATIC".to_string(),
    }
}

/// Script a mined donation of `amount` base units to `campaign_id`.
fn mine_donation(gateway: &FakeGateway, hash: &str, campaign_id: i64, amount: u128) {
    gateway.add_receipt(FakeGateway::receipt(
        hash,
        DONATION_CONTRACT,
        vec![encode::donation_made(DONATION_CONTRACT, campaign_id, 1, DONOR_ADDRESS, amount)],
    ));
}

async fn raised(state: &AppState, campaign_id: i64) -> (f64, i64) {
    let campaign = db::get_campaign(&state.pool, campaign_id).await.unwrap().unwrap();
    (campaign.raised_amount, campaign.donor_count)
}

#[tokio::test]
async fn two_donations_complete_the_campaign() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 40_000 * UNIT);
    mine_donation(&gateway, &tx_hash(2), campaign, 60_000 * UNIT);

    let a = submit_claim(&state, &donor("alice"), claim(campaign, 40_000.0, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(a.status, DonationStatus::Confirmed);
    let c = db::get_campaign(&state.pool, campaign).await.unwrap().unwrap();
    assert_eq!(c.raised_amount, 40_000.0);
    assert_eq!(c.donor_count, 1);
    assert_eq!(c.status, CampaignStatus::Active);

    submit_claim(&state, &donor("bob"), claim(campaign, 60_000.0, &tx_hash(2)))
        .await
        .unwrap();
    let c = db::get_campaign(&state.pool, campaign).await.unwrap().unwrap();
    assert_eq!(c.raised_amount, 100_000.0);
    assert_eq!(c.donor_count, 2);
    assert_eq!(c.status, CampaignStatus::Completed);

    // A completed campaign accepts no further claims.
    mine_donation(&gateway, &tx_hash(3), campaign, UNIT);
    let err = submit_claim(&state, &donor("carol"), claim(campaign, 1.0, &tx_hash(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::State(StateError::InvalidState(_))));
}

#[tokio::test]
async fn donation_meeting_the_target_exactly_completes_the_campaign() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 25_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 25_000 * UNIT);

    let d = submit_claim(&state, &donor("alice"), claim(campaign, 25_000.0, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(d.onchain_amount, Some(25_000.0));
    let c = db::get_campaign(&state.pool, campaign).await.unwrap().unwrap();
    assert_eq!(c.raised_amount, 25_000.0);
    assert_eq!(c.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn reused_hash_after_completion_is_still_a_duplicate() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 40_000 * UNIT);
    mine_donation(&gateway, &tx_hash(2), campaign, 60_000 * UNIT);
    submit_claim(&state, &donor("alice"), claim(campaign, 40_000.0, &tx_hash(1)))
        .await
        .unwrap();
    submit_claim(&state, &donor("bob"), claim(campaign, 60_000.0, &tx_hash(2)))
        .await
        .unwrap();

    for who in ["bob", "mallory"] {
        let err = submit_claim(&state, &donor(who), claim(campaign, 60_000.0, &tx_hash(2)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_TRANSACTION");
    }
    assert_eq!(raised(&state, campaign).await, (100_000.0, 2));
}

#[tokio::test]
async fn pending_claim_survives_campaign_completion() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 10.0).await;
    gateway.add_pending(&tx_hash(1));
    assert!(submit_claim(&state, &donor("alice"), claim(campaign, 4.0, &tx_hash(1)))
        .await
        .is_err());

    mine_donation(&gateway, &tx_hash(2), campaign, 10 * UNIT);
    submit_claim(&state, &donor("bob"), claim(campaign, 10.0, &tx_hash(2)))
        .await
        .unwrap();

    // Alice's transaction was already recorded while the campaign was active.
    mine_donation(&gateway, &tx_hash(1), campaign, 4 * UNIT);
    let d = submit_claim(&state, &donor("alice"), claim(campaign, 4.0, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(d.status, DonationStatus::Confirmed);
    assert_eq!(raised(&state, campaign).await, (14.0, 2));
}

#[tokio::test]
async fn resubmitting_with_a_different_amount_is_rejected() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    gateway.add_pending(&tx_hash(1));
    assert!(submit_claim(&state, &donor("alice"), claim(campaign, 2.0, &tx_hash(1)))
        .await
        .is_err());

    let calls = gateway.calls();
    let err = submit_claim(&state, &donor("alice"), claim(campaign, 20.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
    assert_eq!(gateway.calls(), calls);
    let d = db::get_donation_by_tx(&state.pool, &tx_hash(1)).await.unwrap().unwrap();
    assert_eq!(d.amount, 2.0);
    assert_eq!(d.status, DonationStatus::Pending);
}

#[tokio::test]
async fn confirmed_donation_records_chain_facts() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let hash = tx_hash(0xabc);
    let upper = format!("0x{}", hash[2..].to_ascii_uppercase());
    mine_donation(&gateway, &hash, campaign, 5 * UNIT);

    let d = submit_claim(&state, &donor("alice"), claim(campaign, 5.0, &upper))
        .await
        .unwrap();
    assert_eq!(d.transaction_hash, hash);
    assert_eq!(d.donor_address.as_deref(), Some(DONOR_ADDRESS));
    assert_eq!(d.onchain_amount, Some(5.0));
    assert_eq!(d.block_number, Some(42));
    assert_eq!(d.block_timestamp, Some(1_700_000_042));
    assert_eq!(d.gas_used.as_deref(), Some("50000"));
    assert_eq!(d.gas_fee.as_deref(), Some("1500000000000000"));
    assert!(d.confirmed_at.is_some());
}

#[tokio::test]
async fn reused_hash_never_credits_twice() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 10 * UNIT);

    submit_claim(&state, &donor("alice"), claim(campaign, 10.0, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(raised(&state, campaign).await, (10.0, 1));

    for who in ["alice", "mallory"] {
        let err = submit_claim(&state, &donor(who), claim(campaign, 10.0, &tx_hash(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconciliation(ReconciliationError::DuplicateTransaction(_))
        ));
        assert_eq!(err.code(), "DUPLICATE_TRANSACTION");
    }
    assert_eq!(raised(&state, campaign).await, (10.0, 1));
}

#[tokio::test]
async fn pending_hash_claimed_by_someone_else_is_duplicate() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    gateway.add_pending(&tx_hash(1));

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 10.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Chain(ChainError::NotConfirmed(_))));

    let err = submit_claim(&state, &donor("mallory"), claim(campaign, 10.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Reconciliation(ReconciliationError::DuplicateTransaction(_))
    ));
}

#[tokio::test]
async fn reconciling_a_confirmed_donation_is_a_no_op() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 10 * UNIT);

    let first = submit_claim(&state, &donor("alice"), claim(campaign, 10.0, &tx_hash(1)))
        .await
        .unwrap();
    let calls = gateway.calls();

    let second = reconcile(&state, first.id).await.unwrap();
    assert_eq!(second.status, DonationStatus::Confirmed);
    assert_eq!(second.onchain_amount, first.onchain_amount);
    assert_eq!(second.block_number, first.block_number);
    assert_eq!(second.confirmed_at, first.confirmed_at);
    assert_eq!(gateway.calls(), calls);
    assert_eq!(raised(&state, campaign).await, (10.0, 1));
}

#[tokio::test]
async fn amount_within_tolerance_confirms() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 5 * UNIT);

    let d = submit_claim(&state, &donor("alice"), claim(campaign, 5.00005, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(d.status, DonationStatus::Confirmed);
    // The campaign is credited with what the chain reports.
    assert_eq!(raised(&state, campaign).await, (5.0, 1));
}

#[tokio::test]
async fn amount_one_unit_off_fails_the_donation() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 5 * UNIT);

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 6.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AMOUNT_MISMATCH");

    let d = db::get_donation_by_tx(&state.pool, &tx_hash(1)).await.unwrap().unwrap();
    assert_eq!(d.status, DonationStatus::Failed);
    assert_eq!(d.failure_code.as_deref(), Some("AMOUNT_MISMATCH"));
    assert_eq!(raised(&state, campaign).await, (0.0, 0));

    // The failed hash cannot be claimed again.
    let err = submit_claim(&state, &donor("alice"), claim(campaign, 5.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_TRANSACTION");
}

#[tokio::test]
async fn unknown_transaction_fails() {
    let (_dir, state, _gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 1.0, &tx_hash(9)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Chain(ChainError::NotFound(_))));
    let d = db::get_donation_by_tx(&state.pool, &tx_hash(9)).await.unwrap().unwrap();
    assert_eq!(d.status, DonationStatus::Failed);
    assert_eq!(d.failure_code.as_deref(), Some("CHAIN_TX_NOT_FOUND"));
}

#[tokio::test]
async fn rpc_outage_leaves_donation_pending_for_retry() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 3 * UNIT);
    gateway.set_unavailable(true);

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 3.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Chain(ChainError::RpcUnavailable(_))));
    let pending = db::get_donation_by_tx(&state.pool, &tx_hash(1)).await.unwrap().unwrap();
    assert_eq!(pending.status, DonationStatus::Pending);
    assert_eq!(raised(&state, campaign).await, (0.0, 0));

    gateway.set_unavailable(false);
    let d = reconcile(&state, pending.id).await.unwrap();
    assert_eq!(d.status, DonationStatus::Confirmed);
    assert_eq!(raised(&state, campaign).await, (3.0, 1));
}

#[tokio::test]
async fn same_donor_can_resubmit_a_pending_claim() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;
    gateway.add_pending(&tx_hash(1));

    assert!(submit_claim(&state, &donor("alice"), claim(campaign, 2.0, &tx_hash(1)))
        .await
        .is_err());

    mine_donation(&gateway, &tx_hash(1), campaign, 2 * UNIT);
    let d = submit_claim(&state, &donor("alice"), claim(campaign, 2.0, &tx_hash(1)))
        .await
        .unwrap();
    assert_eq!(d.status, DonationStatus::Confirmed);
    assert_eq!(raised(&state, campaign).await, (2.0, 1));
}

#[tokio::test]
async fn parallel_confirmations_are_all_counted() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000_000.0).await;
    for n in 0..10 {
        mine_donation(&gateway, &tx_hash(100 + n), campaign, 7 * UNIT);
    }

    let mut handles = Vec::new();
    for n in 0..10 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let who = format!("donor-{n}");
            submit_claim(&state, &donor(&who), claim(campaign, 7.0, &tx_hash(100 + n))).await
        }));
    }
    for handle in handles {
        let d = handle.await.unwrap().unwrap();
        assert_eq!(d.status, DonationStatus::Confirmed);
    }
    assert_eq!(raised(&state, campaign).await, (70.0, 10));
}

#[tokio::test]
async fn admin_reversal_debits_once() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 10.0).await;
    mine_donation(&gateway, &tx_hash(1), campaign, 10 * UNIT);
    let d = submit_claim(&state, &donor("alice"), claim(campaign, 10.0, &tx_hash(1)))
        .await
        .unwrap();
    let c = db::get_campaign(&state.pool, campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);

    let err = reverse(&state, &donor(OWNER), d.id, "reorg").await.unwrap_err();
    assert!(matches!(err, AppError::State(StateError::Unauthorized(_))));

    let reversed = reverse(&state, &admin(), d.id, "reorg").await.unwrap();
    assert_eq!(reversed.status, DonationStatus::Failed);
    assert_eq!(reversed.failure_code.as_deref(), Some("REVERSED"));
    let c = db::get_campaign(&state.pool, campaign).await.unwrap().unwrap();
    assert_eq!((c.raised_amount, c.donor_count), (0.0, 0));
    assert_eq!(c.status, CampaignStatus::Active);

    let err = reverse(&state, &admin(), d.id, "reorg").await.unwrap_err();
    assert!(matches!(err, AppError::State(StateError::InvalidState(_))));
    assert_eq!(raised(&state, campaign).await, (0.0, 0));
}

#[tokio::test]
async fn malformed_claims_are_rejected_before_touching_the_chain() {
    let (_dir, state, gateway) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 1_000.0).await;

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 1.0, "0x1234"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let err = submit_claim(&state, &donor("alice"), claim(campaign, 0.0, &tx_hash(1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let mut other_network = claim(campaign, 1.0, &tx_hash(1));
    other_network.network = Network::Ethereum;
    let err = submit_claim(&state, &donor("alice"), other_network)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    assert_eq!(gateway.calls(), 0);
}
