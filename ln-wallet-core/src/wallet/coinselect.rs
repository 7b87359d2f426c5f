//! Coin selection, fee estimation, and transaction signing (§4.3).
//!
//! The recursive coin selector from the upstream source is implemented
//! iteratively over an explicit remaining-UTXO deque (§9 design note);
//! termination is bounded by the number of available UTXOs.

use std::collections::VecDeque;

use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSighashType, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};

use super::utxo::{available_utxos, available_utxos_filtered, Utxo};
use super::WalletState;
use crate::error::CoinSelectionError;

/// A dummy 71-byte segwit witness used purely to size the transaction for
/// fee estimation: (signature up to 72 bytes incl. sighash flag, rounded to
/// a typical 71-byte low-S DER signature) + a 33-byte compressed pubkey.
const DUMMY_WITNESS_LEN: usize = 71;

/// Weight units per vbyte conversion constant.
const WITNESS_SCALE_FACTOR: u64 = 4;

fn dummy_witness() -> Witness {
    let mut witness = Witness::new();
    witness.push(vec![0u8; DUMMY_WITNESS_LEN]);
    witness.push(vec![0u8; 33]);
    witness
}

/// The weight of `tx` once every input carries the dummy witness, i.e. the
/// weight used for fee estimation before real signatures exist.
fn estimated_weight(tx: &Transaction) -> u64 {
    let mut tx = tx.clone();
    for input in &mut tx.input {
        input.witness = dummy_witness();
    }
    tx.weight() as u64
}

fn fee_for_weight(weight: u64, fee_rate_per_kw: u64) -> u64 {
    // fee = floor(weight * fee_rate_per_kw / 1000); weight here is already
    // in weight units (kw = per-1000-weight-units), matching lightning's
    // feerate convention, not the usual vbyte-based sat/vB.
    weight * fee_rate_per_kw / 1000
}

fn build_unsigned(utxos: &[Utxo], outputs: &[TxOut], change: Option<TxOut>) -> Transaction {
    let mut output = outputs.to_vec();
    if let Some(change) = change {
        output.push(change);
    }
    Transaction {
        version: 2,
        lock_time: PackedLockTime(0),
        input: utxos
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: Script::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

fn outputs_total(outputs: &[TxOut]) -> u64 {
    outputs.iter().map(|o| o.value).sum()
}

/// Builds and selects inputs for a transaction paying `outputs`, following
/// the six-branch greedy termination condition from §4.3: UTXOs are sorted
/// ascending by value and added one at a time until either the no-change
/// total covers the payment (branches 1-3) or the with-change total does
/// (branches 4-6), at which point at most one change output is emitted.
pub fn complete_transaction(
    state: &WalletState,
    outputs: Vec<TxOut>,
    change_script: Script,
    fee_rate_per_kw: u64,
) -> Result<Transaction, CoinSelectionError> {
    if outputs.is_empty() {
        return Err(CoinSelectionError::NoOutputs);
    }
    let amount = outputs_total(&outputs);
    let dust_limit = state.config.dust_limit_sat;
    if amount <= dust_limit {
        return Err(CoinSelectionError::AmountBelowDustLimit {
            amount,
            dust_limit,
        });
    }

    // Ascending by value; ties broken by outpoint for determinism.
    let mut sorted: Vec<Utxo> = available_utxos(state);
    sorted.sort_by(|a, b| {
        a.value_sat()
            .cmp(&b.value_sat())
            .then_with(|| format!("{:?}", a.outpoint).cmp(&format!("{:?}", b.outpoint)))
    });
    let mut remaining: VecDeque<Utxo> = sorted.into();

    let mut selected: Vec<Utxo> = Vec::new();
    let change_txout = TxOut {
        value: 0,
        script_pubkey: change_script.clone(),
    };

    loop {
        let total: u64 = selected.iter().map(|u| u.value_sat()).sum();
        let no_change_tx = build_unsigned(&selected, &outputs, None);
        let fee_no_change = fee_for_weight(estimated_weight(&no_change_tx), fee_rate_per_kw);

        if total.saturating_sub(fee_no_change) < amount {
            // Branches 1-2: not enough even ignoring change; add a UTXO.
            match remaining.pop_front() {
                Some(utxo) => {
                    selected.push(utxo);
                    continue;
                }
                None => {
                    return Err(CoinSelectionError::InsufficientFunds {
                        available: total,
                        needed: amount + fee_no_change,
                    });
                }
            }
        }

        if total.saturating_sub(fee_no_change) <= amount + dust_limit {
            // Branch 3: leftover too small to be a change output; donate it
            // to fees instead.
            return Ok(build_unsigned(&selected, &outputs, None));
        }

        let with_change_tx = build_unsigned(&selected, &outputs, Some(change_txout.clone()));
        let fee_with_change = fee_for_weight(estimated_weight(&with_change_tx), fee_rate_per_kw);

        if total.saturating_sub(fee_with_change) <= amount + dust_limit {
            if remaining.is_empty() {
                // Branch 4: no more UTXOs to add; accept without change.
                return Ok(build_unsigned(&selected, &outputs, None));
            }
            // Branch 5: could still reach a healthy change amount; add one
            // more UTXO and re-evaluate.
            selected.push(remaining.pop_front().expect("checked non-empty"));
            continue;
        }

        // Branch 6: emit the change output.
        let change_value = total - amount - fee_with_change;
        let change = TxOut {
            value: change_value,
            script_pubkey: change_script,
        };
        return Ok(build_unsigned(&selected, &outputs, Some(change)));
    }
}

/// Spends the entire UTXO set (including unconfirmed and otherwise-locked
/// outputs) in one transaction; the sole output's amount is
/// `total_balance - fee`.
pub fn spend_all(
    state: &WalletState,
    destination: Script,
    fee_rate_per_kw: u64,
) -> Result<Transaction, CoinSelectionError> {
    // Unlike `complete_transaction`, `spend_all` always sweeps every known
    // UTXO regardless of the wallet's usual `allow_spend_unconfirmed`
    // policy.
    let all_utxos = available_utxos_filtered(state, true);

    if all_utxos.is_empty() {
        return Err(CoinSelectionError::InsufficientFunds {
            available: 0,
            needed: 1,
        });
    }
    let total: u64 = all_utxos.iter().map(|u| u.value_sat()).sum();
    let placeholder_output = TxOut {
        value: total,
        script_pubkey: destination.clone(),
    };
    let draft = build_unsigned(&all_utxos, &[placeholder_output], None);
    let fee = fee_for_weight(estimated_weight(&draft), fee_rate_per_kw);
    let value = total
        .checked_sub(fee)
        .ok_or(CoinSelectionError::InsufficientFunds {
            available: total,
            needed: fee,
        })?;
    if value <= state.config.dust_limit_sat {
        return Err(CoinSelectionError::AmountBelowDustLimit {
            amount: value,
            dust_limit: state.config.dust_limit_sat,
        });
    }
    let output = TxOut {
        value,
        script_pubkey: destination,
    };
    Ok(build_unsigned(&all_utxos, &[output], None))
}

/// Signs every input of `tx` with SIGHASH_ALL segwit v0, writing the P2SH
/// wrap script (a push of the p2wpkh redeem script) and a
/// `(signature, pubkey)` witness.
pub fn sign_transaction(
    tx: &mut Transaction,
    inputs: &[(&Utxo, &bitcoin::PrivateKey)],
) -> anyhow::Result<()> {
    let secp = Secp256k1::new();
    let mut cache = SighashCache::new(&*tx);
    let mut sighashes = Vec::with_capacity(inputs.len());
    for (i, (utxo, _)) in inputs.iter().enumerate() {
        let public_key = inputs[i].1.public_key(&secp);
        let redeem_script = Script::new_v0_p2wpkh(&public_key.wpubkey_hash().expect("compressed"));
        let sighash = cache.segwit_signature_hash(
            i,
            &redeem_script,
            utxo.txout.value,
            EcdsaSighashType::All,
        )?;
        sighashes.push(sighash);
    }
    drop(cache);

    for (i, (_utxo, privkey)) in inputs.iter().enumerate() {
        let public_key = privkey.public_key(&secp);
        let message = Message::from_slice(&sighashes[i][..])?;
        let mut signature = secp.sign_ecdsa(&message, &privkey.inner).serialize_der().to_vec();
        signature.push(EcdsaSighashType::All as u8);

        let redeem_script = Script::new_v0_p2wpkh(&public_key.wpubkey_hash().expect("compressed"));
        tx.input[i].script_sig = bitcoin::blockdata::script::Builder::new()
            .push_slice(redeem_script.as_bytes())
            .into_script();
        let mut witness = Witness::new();
        witness.push(signature);
        witness.push(public_key.to_bytes());
        tx.input[i].witness = witness;
    }
    Ok(())
}
