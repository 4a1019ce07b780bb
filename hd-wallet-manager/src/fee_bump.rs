//! Fee bumping of broadcast transactions
//!
//! A [`FeeBumpEngine`] wraps one previously broadcast transaction of a wallet.
//! [`get_info`](FeeBumpEngine::get_info) reconstructs what it spent and paid
//! from the indexer, after which a replacement (RBF cancel or RBF fee bump) or
//! a child (CPFP) can be built.

use std::str::FromStr;

use hd_wallet::bitcoin::consensus::deserialize;
use hd_wallet::bitcoin::{Address, OutPoint, Transaction, Txid};
use hd_wallet::transaction_builder::{CreatedTransaction, Recipient};
use hd_wallet::utxo::Utxo;
use hd_wallet::{Chain, Error, FeeRate};
use tracing::{debug, info};

use crate::error::{IndexerError, Result, WalletError};
use crate::wallet::HdWallet;

/// Sequence of an input that opts out of replacement entirely.
pub const FINAL_SEQUENCE: u32 = 0xffff_ffff;

/// Upper bound of the extra fee rate tried while searching for a CPFP child.
const CPFP_MAX_EXTRA_RATE: u64 = 128;

/// Lifecycle of the wrapped transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpState {
    /// In the mempool
    Broadcast,
    /// Superseded by the given replacement
    Replaced(Txid),
    /// Mined, nothing left to bump
    Confirmed,
}

/// What the wrapped transaction spent, paid and created.
#[derive(Debug, Clone)]
pub struct FeeBumpInfo {
    pub txid: Txid,
    pub fee: u64,
    /// Fee per virtual byte, rounded down, at least 1
    pub fee_rate: u64,
    pub vsize: usize,
    pub confirmations: u32,
    /// Wallet outputs the transaction spends
    pub utxos: Vec<Utxo>,
    /// Inputs that do not belong to the wallet
    pub unknown_inputs: Vec<OutPoint>,
    /// Outputs paying back to the wallet, spendable by a CPFP child
    pub own_outputs: Vec<Utxo>,
    /// Outputs paying third parties
    pub targets: Vec<(Address, u64)>,
    /// Outputs without an address form, such as `OP_RETURN`
    pub unaddressable_outputs: usize,
    /// Total paid back to the wallet
    pub change_amount: u64,
}

/// Builds replacements and children for one broadcast transaction.
#[derive(Debug)]
pub struct FeeBumpEngine<'w> {
    wallet: &'w HdWallet,
    tx: Transaction,
    info: Option<FeeBumpInfo>,
    state: BumpState,
}

impl<'w> FeeBumpEngine<'w> {
    pub fn new(wallet: &'w HdWallet, tx: Transaction) -> Self {
        Self {
            wallet,
            tx,
            info: None,
            state: BumpState::Broadcast,
        }
    }

    /// Wrap a transaction given as consensus-encoded hex.
    pub fn from_hex(wallet: &'w HdWallet, tx_hex: &str) -> Result<Self> {
        let bytes = hex::decode(tx_hex).map_err(|e| Error::Protocol(format!("transaction hex: {}", e)))?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|e| Error::Protocol(format!("undecodable transaction: {}", e)))?;
        Ok(Self::new(wallet, tx))
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn state(&self) -> BumpState {
        self.state
    }

    /// Record that a replacement was broadcast. Later bumps must start from it.
    pub fn mark_replaced(&mut self, replacement: Txid) {
        info!("{} replaced by {}", self.txid(), replacement);
        self.state = BumpState::Replaced(replacement);
    }

    /// Highest input sequence. A replacement uses one more.
    pub fn max_used_sequence(&self) -> u32 {
        self.tx.input.iter().map(|i| i.sequence.0).max().unwrap_or(0)
    }

    /// Whether some input leaves room for a replacement.
    pub fn is_sequence_replaceable(&self) -> bool {
        self.max_used_sequence() < FINAL_SEQUENCE
    }

    /// Fetch the transaction's metadata and parents and work out its fee and
    /// which inputs and outputs belong to the wallet.
    pub async fn get_info(&mut self) -> Result<&FeeBumpInfo> {
        let txid = self.txid();
        let mut wanted = vec![txid];
        for input in &self.tx.input {
            if !wanted.contains(&input.previous_output.txid) {
                wanted.push(input.previous_output.txid);
            }
        }
        let fetched = self.wallet.indexer().multi_get_transaction_by_txid(&wanted).await?;

        let confirmations = fetched
            .get(&txid)
            .ok_or_else(|| IndexerError::Protocol(format!("{} is unknown to the indexer", txid)))?
            .confirmations
            .unwrap_or(0);

        let mut went_in = 0u64;
        let mut utxos = Vec::new();
        let mut unknown_inputs = Vec::new();
        for input in &self.tx.input {
            let outpoint = input.previous_output;
            let parent = fetched
                .get(&outpoint.txid)
                .and_then(|tx| Some((tx, tx.output(outpoint.vout)?)))
                .ok_or_else(|| IndexerError::Protocol(format!("previous output {} not found", outpoint)))?;
            let (parent_tx, output) = parent;
            went_in += output.value;
            let owned = output.address.as_deref().and_then(|address| {
                let (key, path) = self.wallet.key_of(address)?;
                let mut utxo = Utxo::new(outpoint.txid, outpoint.vout, output.value, address)
                    .with_key(key, path)
                    .with_confirmations(parent_tx.confirmations.unwrap_or(0));
                utxo.prev_tx = parent_tx.transaction();
                Some(utxo)
            });
            match owned {
                Some(utxo) => utxos.push(utxo),
                None => unknown_inputs.push(outpoint),
            }
        }

        let went_out: u64 = self.tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = went_in
            .checked_sub(went_out)
            .ok_or_else(|| Error::Protocol(format!("{} spends more than its inputs", txid)))?;
        let vsize = self.tx.vsize();
        let fee_rate = (fee / vsize as u64).max(1);

        let network = self.wallet.config().network;
        let mut own_outputs = Vec::new();
        let mut targets = Vec::new();
        let mut unaddressable_outputs = 0;
        let mut change_amount = 0;
        for (n, output) in self.tx.output.iter().enumerate() {
            let value = output.value.to_sat();
            let Ok(address) = Address::from_script(&output.script_pubkey, network) else {
                unaddressable_outputs += 1;
                continue;
            };
            match self.wallet.key_of(&address.to_string()) {
                Some((key, path)) => {
                    change_amount += value;
                    own_outputs.push(
                        Utxo::new(txid, n as u32, value, address.to_string())
                            .with_key(key, path)
                            .with_confirmations(confirmations)
                            .with_prev_tx(self.tx.clone()),
                    );
                }
                None => targets.push((address, value)),
            }
        }

        if confirmations > 0 {
            self.state = BumpState::Confirmed;
        }
        debug!("{}: fee {} over {} vB, {} foreign inputs", txid, fee, vsize, unknown_inputs.len());

        Ok(&*self.info.insert(FeeBumpInfo {
            txid,
            fee,
            fee_rate,
            vsize,
            confirmations,
            utxos,
            unknown_inputs,
            own_outputs,
            targets,
            unaddressable_outputs,
            change_amount,
        }))
    }

    /// Info from the last [`get_info`](Self::get_info).
    pub fn info(&self) -> Result<&FeeBumpInfo> {
        self.info.as_ref().ok_or_else(|| WalletError::from(Error::MissingData("fee bump info not fetched".into())))
    }

    /// Every input is the wallet's and at least one output pays someone else.
    pub fn can_cancel(&self) -> Result<bool> {
        let info = self.info()?;
        Ok(self.can_bump()? && !info.targets.is_empty())
    }

    /// Every input is the wallet's and the transaction is still pending.
    pub fn can_bump(&self) -> Result<bool> {
        Ok(self.info()?.unknown_inputs.is_empty() && self.state == BumpState::Broadcast)
    }

    /// Checks shared by every kind of bump.
    fn checked_info(&self, new_rate: FeeRate) -> Result<&FeeBumpInfo> {
        let info = self.info()?;
        if self.state != BumpState::Broadcast {
            return Err(Error::NotReplaceable.into());
        }
        if let Some(outpoint) = info.unknown_inputs.first() {
            return Err(Error::UnknownInput(outpoint.to_string()).into());
        }
        if new_rate.as_sat_per_vb() <= info.fee_rate {
            return Err(Error::FeeRateTooLow {
                current: info.fee_rate,
                requested: new_rate.as_sat_per_vb(),
            }
            .into());
        }
        Ok(info)
    }

    fn checked_replaceable(&self, new_rate: FeeRate) -> Result<&FeeBumpInfo> {
        let info = self.checked_info(new_rate)?;
        if !self.is_sequence_replaceable() {
            return Err(Error::NotReplaceable.into());
        }
        Ok(info)
    }

    fn change_address(&self) -> Result<Address> {
        let address = self.wallet.current_address(Chain::Internal)?;
        Ok(parse_own_address(&address, self.wallet)?)
    }

    /// Replace the transaction with one sending all its inputs back to the wallet.
    pub fn create_rbf_cancel(&self, new_rate: FeeRate) -> Result<CreatedTransaction> {
        let info = self.checked_replaceable(new_rate)?;
        if info.targets.is_empty() {
            return Err(Error::CannotCancel.into());
        }
        let destination = self.change_address()?;
        let builder = self
            .wallet
            .builder(new_rate.into(), Some(self.max_used_sequence() + 1), false)
            .add_recipient(Recipient::send_max(destination));
        let created = self.wallet.keys().build_transaction(&builder, &info.utxos)?;
        info!("RBF cancel of {}: fee {} -> {}", info.txid, info.fee, created.fee);
        Ok(created)
    }

    /// Replace the transaction with one paying the same targets at a higher rate.
    /// Only the original inputs are used; the extra fee comes out of change.
    pub fn create_rbf_bump(&self, new_rate: FeeRate) -> Result<CreatedTransaction> {
        let info = self.checked_replaceable(new_rate)?;
        if info.unaddressable_outputs > 0 {
            return Err(Error::UnsupportedScriptType("cannot carry over outputs without an address".into()).into());
        }
        let change = self.change_address()?;

        let mut recipients: Vec<Recipient> =
            info.targets.iter().map(|(address, value)| Recipient::new(address.clone(), *value)).collect();
        match recipients.len() {
            // a self-payment keeps paying the wallet
            0 => recipients.push(Recipient::send_max(change.clone())),
            // without change this was a send-max, so the target absorbs the fee
            1 if info.change_amount == 0 => recipients[0].value = None,
            _ => {}
        }

        let builder = self.wallet.with_change(
            self.wallet
                .builder(new_rate.into(), Some(self.max_used_sequence() + 1), false)
                .add_recipients(recipients),
            change,
        );
        let created = self.wallet.keys().build_transaction(&builder, &info.utxos)?;
        info!("RBF bump of {}: fee {} -> {}", info.txid, info.fee, created.fee);
        Ok(created)
    }

    /// Spend the wallet's outputs of the pending transaction in a child whose fee
    /// lifts the combined rate of parent and child to `new_rate`.
    ///
    /// The child starts at `2 * new_rate - current_rate` and the surcharge doubles
    /// until `parent fee + child fee >= new_rate * (parent vsize + child vsize)`.
    pub fn create_cpfp(&self, new_rate: FeeRate) -> Result<CreatedTransaction> {
        let info = self.checked_info(new_rate)?;
        if info.own_outputs.is_empty() {
            return Err(Error::MissingData("transaction pays nothing back to the wallet".into()).into());
        }
        let destination = self.change_address()?;
        let requested = new_rate.as_sat_per_vb();
        let base = (2 * requested).saturating_sub(info.fee_rate).max(1);

        let mut extra = 0;
        let mut reached = 0;
        while extra <= CPFP_MAX_EXTRA_RATE {
            let builder = self
                .wallet
                .builder(FeeRate::from_sat_per_vb(base + extra).into(), None, false)
                .add_recipient(Recipient::send_max(destination.clone()));
            let child = self.wallet.keys().build_transaction(&builder, &info.own_outputs)?;

            let total_fee = info.fee + child.fee;
            let total_size = (info.vsize + child.vsize) as u64;
            reached = total_fee / total_size;
            if total_fee >= requested * total_size {
                info!("CPFP for {}: child fee {}, combined {} sat/vB", info.txid, child.fee, reached);
                return Ok(child);
            }
            extra = if extra == 0 {
                2
            } else {
                extra * 2
            };
        }
        Err(Error::FeeTargetUnreachable {
            reached,
            requested,
        }
        .into())
    }
}

fn parse_own_address(address: &str, wallet: &HdWallet) -> hd_wallet::Result<Address> {
    Address::from_str(address)
        .map_err(|_| Error::InvalidAddress(address.to_string()))?
        .require_network(wallet.config().network)
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

