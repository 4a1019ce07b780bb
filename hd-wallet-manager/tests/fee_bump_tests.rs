//! Fee bump tests against the mock indexer

use std::sync::Arc;

use assert_matches::assert_matches;
use hd_wallet::bitcoin::consensus::encode::serialize_hex;
use hd_wallet::bitcoin::{
    absolute, transaction, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use hd_wallet::{Chain, Error, FeeRate, HdKeyChain, Recipient, ScriptType, WalletConfig};
use hd_wallet_manager::mock::MockIndexer;
use hd_wallet_manager::{BumpState, FeeBumpEngine, HdWallet, SendRequest, WalletError};

const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// An address of an unrelated wallet.
fn foreign() -> Address {
    HdKeyChain::from_mnemonic(ABANDON, "TREZOR", ScriptType::P2wpkh, Network::Bitcoin)
        .unwrap()
        .derive_address(Chain::External, 0)
        .unwrap()
}

async fn funded_wallet() -> (Arc<MockIndexer>, HdWallet) {
    let mock = Arc::new(MockIndexer::new(Network::Bitcoin));
    let keychain = HdKeyChain::from_mnemonic(ABANDON, "", ScriptType::P2wpkh, Network::Bitcoin).unwrap();
    let mut wallet = HdWallet::new(keychain.into(), WalletConfig::mainnet(), mock.clone()).unwrap();
    let receive = wallet.keys().derive_address(Chain::External, 0).unwrap();
    mock.fund(&receive.to_string(), 100_000, 6).await;
    wallet.fetch_balance().await.unwrap();
    wallet.fetch_transactions().await.unwrap();
    wallet.fetch_utxo().await.unwrap();
    (mock, wallet)
}

/// Send `value` to `to` at 2 sat/vB and broadcast it.
async fn send(wallet: &HdWallet, to: Address, value: u64, sequence: Option<u32>) -> String {
    let change = wallet.keys().derive_address(Chain::Internal, 0).unwrap();
    let mut request = SendRequest::new(vec![Recipient::new(to, value)], FeeRate::from_sat_per_vb(2))
        .with_change_address(change);
    if let Some(sequence) = sequence {
        request = request.with_sequence(sequence);
    }
    let created = wallet.create_transaction(&request).unwrap();
    let hex = created.to_hex().unwrap();
    wallet.broadcast(&hex).await.unwrap();
    hex
}

#[tokio::test]
async fn test_info_of_a_pending_payment() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;

    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    let info = engine.get_info().await.unwrap().clone();
    assert_eq!(info.confirmations, 0);
    assert_eq!(info.utxos.len(), 1);
    assert!(info.unknown_inputs.is_empty());
    assert_eq!(info.targets, vec![(foreign(), 30_000)]);
    assert_eq!(info.own_outputs.len(), 1);
    assert_eq!(info.change_amount + 30_000 + info.fee, 100_000);
    assert!(info.fee_rate >= 2);

    assert_eq!(engine.state(), BumpState::Broadcast);
    assert!(engine.can_bump().unwrap());
    assert!(engine.can_cancel().unwrap());
    assert_eq!(engine.max_used_sequence(), 0x8000_0000);
    assert!(engine.is_sequence_replaceable());
}

#[tokio::test]
async fn test_rbf_bump_keeps_the_payment() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    let current = engine.get_info().await.unwrap().fee_rate;

    assert_matches!(
        engine.create_rbf_bump(FeeRate::from_sat_per_vb(current)),
        Err(WalletError::Core(Error::FeeRateTooLow { requested, .. })) if requested == current
    );

    let bumped = engine.create_rbf_bump(FeeRate::from_sat_per_vb(10)).unwrap();
    let info = engine.info().unwrap();
    assert!(bumped.fee > info.fee);
    assert!(bumped.outputs.iter().any(|o| o.address == foreign() && o.value == 30_000 && !o.is_change));
    let tx = bumped.tx.unwrap();
    assert!(tx.input.iter().all(|i| i.sequence.0 == 0x8000_0001));
    assert_eq!(tx.input[0].previous_output, info.utxos[0].outpoint());
}

#[tokio::test]
async fn test_rbf_cancel_returns_everything() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    engine.get_info().await.unwrap();

    let cancel = engine.create_rbf_cancel(FeeRate::from_sat_per_vb(10)).unwrap();
    assert_eq!(cancel.outputs.len(), 1);
    assert!(wallet.we_own_address(&cancel.outputs[0].address.to_string()));
    assert_eq!(cancel.outputs[0].value + cancel.fee, 100_000);

    let txid = cancel.tx.as_ref().unwrap().compute_txid();
    engine.mark_replaced(txid);
    assert_eq!(engine.state(), BumpState::Replaced(txid));
    assert_matches!(
        engine.create_rbf_cancel(FeeRate::from_sat_per_vb(20)),
        Err(WalletError::Core(Error::NotReplaceable))
    );
}

#[tokio::test]
async fn test_cpfp_lifts_the_combined_rate() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    engine.get_info().await.unwrap();

    let child = engine.create_cpfp(FeeRate::from_sat_per_vb(10)).unwrap();
    let info = engine.info().unwrap();
    assert_eq!(child.inputs, info.own_outputs);
    assert_eq!(child.outputs.len(), 1);

    let total_fee = info.fee + child.fee;
    let total_size = (info.vsize + child.vsize) as u64;
    assert!(total_fee >= 10 * total_size);
    assert_eq!(child.tx.unwrap().input[0].sequence.0, 0x8000_0000);
}

#[tokio::test]
async fn test_cpfp_never_falls_short_of_the_requested_rate() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    engine.get_info().await.unwrap();
    let info = engine.info().unwrap().clone();

    let mut built = 0;
    for rate in 3..=80 {
        match engine.create_cpfp(FeeRate::from_sat_per_vb(rate)) {
            Ok(child) => {
                built += 1;
                let total_fee = info.fee + child.fee;
                let total_size = (info.vsize + child.vsize) as u64;
                assert!(total_fee >= rate * total_size, "{} sat/vB: {} sat over {} vB", rate, total_fee, total_size);
            }
            Err(err) => assert_matches!(
                err,
                WalletError::Core(
                    Error::FeeRateTooLow { .. } | Error::FeeTargetUnreachable { .. } | Error::InsufficientFunds { .. }
                )
            ),
        }
    }
    assert!(built > 0);
}

#[tokio::test]
async fn test_final_sequence_only_allows_cpfp() {
    let (_mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, Some(0xffff_ffff)).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    engine.get_info().await.unwrap();

    assert!(!engine.is_sequence_replaceable());
    assert_matches!(
        engine.create_rbf_bump(FeeRate::from_sat_per_vb(10)),
        Err(WalletError::Core(Error::NotReplaceable))
    );
    assert!(engine.create_cpfp(FeeRate::from_sat_per_vb(10)).is_ok());
}

#[tokio::test]
async fn test_self_payment_cannot_be_cancelled() {
    let (_mock, wallet) = funded_wallet().await;
    let own = wallet.keys().derive_address(Chain::External, 1).unwrap();
    let hex = send(&wallet, own, 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    let info = engine.get_info().await.unwrap();
    assert!(info.targets.is_empty());
    assert_eq!(info.own_outputs.len(), 2);

    assert!(!engine.can_cancel().unwrap());
    assert_matches!(
        engine.create_rbf_cancel(FeeRate::from_sat_per_vb(10)),
        Err(WalletError::Core(Error::CannotCancel))
    );
    let bumped = engine.create_rbf_bump(FeeRate::from_sat_per_vb(10)).unwrap();
    assert_eq!(bumped.outputs.len(), 1);
}

#[tokio::test]
async fn test_foreign_inputs_block_bumping() {
    let (mock, wallet) = funded_wallet().await;
    let funding = mock.fund(&foreign().to_string(), 10_000, 1).await;
    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(funding, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(9_000),
            script_pubkey: wallet.keys().derive_address(Chain::External, 2).unwrap().script_pubkey(),
        }],
    };
    wallet.broadcast(&serialize_hex(&tx)).await.unwrap();

    let mut engine = FeeBumpEngine::new(&wallet, tx);
    let info = engine.get_info().await.unwrap();
    assert_eq!(info.unknown_inputs, vec![OutPoint::new(funding, 0)]);
    assert_eq!(info.fee, 1_000);

    assert!(!engine.can_bump().unwrap());
    assert_matches!(
        engine.create_rbf_bump(FeeRate::from_sat_per_vb(50)),
        Err(WalletError::Core(Error::UnknownInput(_)))
    );
}

#[tokio::test]
async fn test_confirmed_transaction_is_final() {
    let (mock, wallet) = funded_wallet().await;
    let hex = send(&wallet, foreign(), 30_000, None).await;
    let mut engine = FeeBumpEngine::from_hex(&wallet, &hex).unwrap();
    assert_matches!(engine.info(), Err(WalletError::Core(Error::MissingData(_))));

    mock.confirm(&engine.txid(), 1).await;
    engine.get_info().await.unwrap();
    assert_eq!(engine.state(), BumpState::Confirmed);
    assert!(!engine.can_bump().unwrap());
    assert_matches!(
        engine.create_cpfp(FeeRate::from_sat_per_vb(10)),
        Err(WalletError::Core(Error::NotReplaceable))
    );
}

#[tokio::test]
async fn test_unknown_transaction_is_a_protocol_error() {
    let (_mock, wallet) = funded_wallet().await;
    let change = wallet.keys().derive_address(Chain::Internal, 0).unwrap();
    let request = SendRequest::new(vec![Recipient::new(foreign(), 30_000)], FeeRate::from_sat_per_vb(2))
        .with_change_address(change);
    let created = wallet.create_transaction(&request).unwrap();

    let mut engine = FeeBumpEngine::new(&wallet, created.tx.unwrap());
    assert_matches!(engine.get_info().await, Err(WalletError::Indexer(_)));
    assert_matches!(FeeBumpEngine::from_hex(&wallet, "zz"), Err(WalletError::Core(Error::Protocol(_))));
}
