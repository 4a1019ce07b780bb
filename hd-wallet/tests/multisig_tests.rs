//! Multisig wallet tests

use std::str::FromStr;

use hd_wallet::fee::FeeRate;
use hd_wallet::multisig::{cosigner, psbt, setup};
use hd_wallet::signing;
use hd_wallet::transaction_builder::Recipient;
use hd_wallet::{Chain, Error, KeyRef, MultisigFormat, Quorum, TransactionBuilder, Utxo, WalletKeys};

use assert_matches::assert_matches;
use bitcoin::{Address, Network, Txid};

const ZPUB1: &str = "Zpub74ijpfhERJNjhCKXRspTdLJV5eoEmSRZdHqDvp9kVtdVEyiXk7pXxRbfZzQvsDFpfDHEHVtVpx4Dz9DGUWGn2Xk5zG5u45QTMsYS2vjohNQ";
const ZPUB2: &str = "Zpub75mAE8EjyxSzoyPmGnd5E6MyD7ALGNndruWv52xpzimZQKukwvEfXTHqmH8nbbc6ccP5t2aM3mws3pKYSnKpKMMytdbNEZFUxKzztYFM8Pn";
const MNEMONIC3: &str = "accident olympic spawn spider cable track pluck fat code grab fine salt garment kidney crime old often worth member impulse brother smoke garden trash";
const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn setup_text(policy: &str) -> String {
    format!(
        "Name: vault\nPolicy: {}\nDerivation: m/48'/0'/0'/2'\nFormat: P2WSH\n\nD37EAD88: {}\n168DD603: {}\n",
        policy, ZPUB1, ZPUB2
    )
}

fn utxo(quorum: &Quorum, index: u32, value: u64) -> Utxo {
    let address = quorum.derive_address(Chain::External, index).unwrap().to_string();
    Utxo::new(Txid::from_str(&"ab".repeat(32)).unwrap(), index, value, address).with_key(
        KeyRef::Derived {
            chain: Chain::External,
            index,
        },
        None,
    )
}

fn spend(quorum: &Quorum) -> TransactionBuilder {
    TransactionBuilder::new(Network::Bitcoin, FeeRate::from_sat_per_vb(4).into())
        .add_recipient(Recipient::new(
            Address::from_str("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu").unwrap().assume_checked(),
            25_000,
        ))
        .set_change_address(
            quorum.derive_address(Chain::Internal, 0).unwrap(),
            Some(KeyRef::Derived {
                chain: Chain::Internal,
                index: 0,
            }),
        )
}

#[test]
fn test_text_setup_addresses() {
    let quorum = setup::import(&setup_text("2 of 2"), Network::Bitcoin).unwrap();
    assert_eq!(
        quorum.derive_address(Chain::External, 1).unwrap().to_string(),
        "bc1qvwd2d7r46j7u9qyxpedfhe5p075sxuhzd0n6napuvvhq2u5nrmqs9ex90q"
    );
    assert_eq!(
        quorum.derive_address(Chain::Internal, 0).unwrap().to_string(),
        "bc1qtah0p50d4qlftn049k7lldcwh7cs3zkjy9g8xegv63p308hsh9zsf5567q"
    );
}

#[test]
fn test_two_of_three_with_local_mnemonic() {
    // the third key is ours and joins after import
    let mut quorum = setup::import(&setup_text("2 of 3"), Network::Bitcoin).unwrap();
    quorum.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();
    assert_eq!((quorum.m(), quorum.n()), (2, 3));
    assert_eq!(
        quorum.derive_address(Chain::External, 0).unwrap().to_string(),
        "bc1qnpy7c7wz6tvmhdwgyk8ka4du3s9x6uhgjal305xdatmwfa538zxsys5l0t"
    );
    assert_eq!(
        quorum.cosigners()[2].key.encoded(),
        "Zpub74k35j5DkSA6t6SFhPeHv8ENBHdNgAPALWodSWoWxsHo6vbAu2FUGq9QmUEvdEPzBoMswizfsAbTWQYU2ZnvCjdKsFje5TEfjLxuH8arBtp"
    );

    let keys = WalletKeys::from(quorum.clone());
    assert!(keys.has_secret());
    let created = keys.build_transaction(&spend(&quorum), &[utxo(&quorum, 0, 60_000)]).unwrap();
    assert!(created.tx.is_none());
    assert_eq!(psbt::signature_count(&created.psbt), 1);
    assert_eq!(created.psbt.inputs[0].bip32_derivation.len(), 3);
}

#[test]
fn test_two_local_cosigners_finalize() {
    let mut quorum = Quorum::new(2, MultisigFormat::P2wsh, Network::Bitcoin);
    quorum.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();
    quorum.add_mnemonic_cosigner(ABANDON, "", None).unwrap();

    let created = spend(&quorum).build_multisig(&[utxo(&quorum, 3, 60_000)], &quorum).unwrap();
    let tx = created.tx.clone().expect("both signers are local");
    // empty element, two signatures, witness script
    assert_eq!(tx.input[0].witness.len(), 4);
    assert_eq!(tx.output.len(), 2);
    assert_eq!(created.fee_rate(), created.fee / tx.vsize() as u64);
}

#[test]
fn test_cosigning_round_trip() {
    let mut first = Quorum::new(2, MultisigFormat::P2shP2wsh, Network::Bitcoin);
    first.add_mnemonic_cosigner(MNEMONIC3, "", None).unwrap();
    let abandon_key = {
        let mut signer = Quorum::new(1, MultisigFormat::P2shP2wsh, Network::Bitcoin);
        signer.add_mnemonic_cosigner(ABANDON, "", None).unwrap();
        signer.cosigners()[0].key.clone()
    };
    first.add_cosigner(abandon_key.clone()).unwrap();

    let created = spend(&first).build_multisig(&[utxo(&first, 0, 80_000)], &first).unwrap();
    assert!(created.tx.is_none());
    assert_eq!(psbt::signature_count(&created.psbt), 1);

    // the second cosigner signs their own copy and the two are merged
    let mut second = Quorum::new(2, MultisigFormat::P2shP2wsh, Network::Bitcoin);
    second.add_cosigner(first.cosigners()[0].key.clone()).unwrap();
    second.add_mnemonic_cosigner(ABANDON, "", None).unwrap();
    let mut theirs = created.psbt.clone();
    assert_eq!(second.sign_psbt(&mut theirs).unwrap(), 1);

    let mut combined = signing::combine(created.psbt, theirs).unwrap();
    assert_eq!(psbt::signature_count(&combined), 2);
    let tx = psbt::finalize_psbt(&mut combined).unwrap().expect("threshold reached");
    assert_eq!(tx.input[0].witness.len(), 4);
    assert!(!tx.input[0].script_sig.is_empty());
}

#[test]
fn test_duplicate_cosigner_rejected() {
    let mut quorum = Quorum::new(2, MultisigFormat::P2wsh, Network::Bitcoin);
    quorum.add_cosigner(cosigner::parse(ZPUB1).unwrap().remove(0)).unwrap();
    assert_matches!(quorum.add_cosigner(cosigner::parse(ZPUB1).unwrap().remove(0)), Err(Error::DuplicateKey(_)));
}
