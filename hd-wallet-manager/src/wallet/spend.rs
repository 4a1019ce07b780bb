//! Creating transactions from wallet funds.

use hd_wallet::bitcoin::Address;
use hd_wallet::transaction_builder::{CreatedTransaction, Recipient, TransactionBuilder};
use hd_wallet::utxo::{self, Utxo};
use hd_wallet::FeePolicy;
use tracing::{debug, info};

use super::HdWallet;
use crate::error::Result;

/// What to send and how.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipients: Vec<Recipient>,
    pub fee: FeePolicy,
    /// Required whenever the selection leaves change
    pub change_address: Option<Address>,
    /// Input sequence, the wallet's RBF default when unset
    pub sequence: Option<u32>,
    /// Return an unsigned PSBT even when keys are available
    pub skip_signing: bool,
    pub include_frozen: bool,
    pub bip69: bool,
    /// Spend exactly from these outputs instead of the wallet's UTXO set
    pub utxos: Option<Vec<Utxo>>,
}

impl SendRequest {
    pub fn new(recipients: Vec<Recipient>, fee: impl Into<FeePolicy>) -> Self {
        Self {
            recipients,
            fee: fee.into(),
            change_address: None,
            sequence: None,
            skip_signing: false,
            include_frozen: false,
            bip69: false,
            utxos: None,
        }
    }

    pub fn with_change_address(mut self, address: Address) -> Self {
        self.change_address = Some(address);
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn skip_signing(mut self, skip: bool) -> Self {
        self.skip_signing = skip;
        self
    }

    pub fn include_frozen(mut self, include: bool) -> Self {
        self.include_frozen = include;
        self
    }

    pub fn with_bip69(mut self, enabled: bool) -> Self {
        self.bip69 = enabled;
        self
    }

    pub fn with_utxos(mut self, utxos: Vec<Utxo>) -> Self {
        self.utxos = Some(utxos);
        self
    }
}

impl HdWallet {
    /// A builder preconfigured from the wallet's settings.
    pub(crate) fn builder(&self, fee: FeePolicy, sequence: Option<u32>, skip_signing: bool) -> TransactionBuilder {
        TransactionBuilder::new(self.config.network, fee)
            .set_sequence(sequence.unwrap_or(self.config.rbf_sequence))
            .set_dust_threshold(self.config.dust_threshold)
            .skip_signing(skip_signing || !self.keys.has_secret())
    }

    /// Attach the key reference of a wallet-owned change address.
    pub(crate) fn with_change(&self, builder: TransactionBuilder, address: Address) -> TransactionBuilder {
        let key = self.key_of(&address.to_string()).map(|(key, _)| key);
        builder.set_change_address(address, key)
    }

    /// Outputs available to coin selection. Before the first UTXO refresh they
    /// are reconstructed from cached transactions.
    pub fn spendable_utxos(&self, include_frozen: bool) -> Vec<Utxo> {
        if !self.state.utxos.is_empty() {
            return self.state.utxos.spendable(include_frozen);
        }
        let records = self.get_transactions();
        utxo::derive_from_transactions(&records, |a| self.we_own_address(a))
            .into_iter()
            .filter(|u| u.is_confirmed())
            .filter(|u| include_frozen || !self.state.utxos.is_frozen(&u.txid, u.vout))
            .filter_map(|u| {
                let (key, path) = self.key_of(&u.address)?;
                Some(u.with_key(key, path))
            })
            .collect()
    }

    /// Select inputs, build and, where keys allow, sign a transaction.
    ///
    /// Watch-only wallets, and requests with `skip_signing`, get an unsigned PSBT
    /// with full derivation metadata and `tx == None`.
    pub fn create_transaction(&self, request: &SendRequest) -> Result<CreatedTransaction> {
        let utxos = match &request.utxos {
            Some(utxos) => utxos.clone(),
            None => self.spendable_utxos(request.include_frozen),
        };
        debug!("Creating transaction from {} candidate outputs", utxos.len());

        let mut builder = self
            .builder(request.fee, request.sequence, request.skip_signing)
            .add_recipients(request.recipients.iter().cloned())
            .set_bip69(request.bip69);
        if let Some(change) = &request.change_address {
            builder = self.with_change(builder, change.clone());
        }

        let created = self.keys.build_transaction(&builder, &utxos)?;
        info!(
            "Created transaction: {} inputs, {} outputs, fee {} ({} sat/vB){}",
            created.inputs.len(),
            created.outputs.len(),
            created.fee,
            created.fee_rate(),
            if created.tx.is_some() {
                ""
            } else {
                ", unsigned"
            }
        );
        Ok(created)
    }
}
