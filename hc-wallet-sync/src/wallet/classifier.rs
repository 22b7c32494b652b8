//! Relevance and stake-role classification of transactions.

use hc_wire::script::{self, ScriptClass, ScriptError};
use hc_wire::{Address, Network, OutPoint, StakeTxType, Transaction};

use crate::storage::LedgerState;

/// What the wallet watches for.
pub trait WatchedSet {
    /// True when the address belongs to the wallet.
    fn controls(&self, address: &Address) -> bool;

    /// Redeem script stored for a script hash.
    fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<&[u8]>;

    /// True when the outpoint is a wallet credit.
    fn owns_output(&self, outpoint: &OutPoint) -> bool;
}

impl WatchedSet for LedgerState {
    fn controls(&self, address: &Address) -> bool {
        self.addr.contains(address)
    }

    fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<&[u8]> {
        self.tx.tx_script(script_hash).or_else(|| self.addr.redeem_script(script_hash))
    }

    fn owns_output(&self, outpoint: &OutPoint) -> bool {
        self.tx.credit(outpoint).is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub relevant: bool,
    pub tx_type: StakeTxType,
    /// Malformed scripts skipped while deciding relevance.
    pub warnings: u32,
}

/// Classifies `tx` against the watched set.
///
/// Inputs are checked before outputs. A script that fails to decode does
/// not make the transaction relevant and is counted as a warning.
pub fn classify<W: WatchedSet + ?Sized>(tx: &Transaction, watched: &W, network: Network) -> Classification {
    let mut warnings = 0;
    let relevant = inputs_relevant(tx, watched, network, &mut warnings)
        || outputs_relevant(tx, watched, network, &mut warnings);
    Classification {
        relevant,
        tx_type: hc_wire::stake::stake_tx_type(tx),
        warnings,
    }
}

fn is_malformed(err: &ScriptError) -> bool {
    matches!(err, ScriptError::Truncated(_) | ScriptError::NotPushOnly(_))
}

fn inputs_relevant<W: WatchedSet + ?Sized>(
    tx: &Transaction,
    watched: &W,
    network: Network,
    warnings: &mut u32,
) -> bool {
    for input in &tx.inputs {
        // Coinbase and stakebase inputs redeem nothing.
        if input.previous_output.hash.is_zero() {
            continue;
        }
        if watched.owns_output(&input.previous_output) {
            return true;
        }

        let sig_script = &input.signature_script;
        if script::is_multisig_sig_script(sig_script) {
            let keys = script::multisig_redeem_script_from_sig_script(sig_script)
                .and_then(|redeem| script::extract_addresses(&redeem, network));
            match keys {
                Ok(extracted) => {
                    if extracted.addresses.iter().any(|a| watched.controls(a)) {
                        return true;
                    }
                }
                Err(e) => {
                    tracing::debug!("Undecodable multisig redemption in {}: {}", tx.tx_hash(), e);
                    *warnings += 1;
                }
            }
            continue;
        }

        match script::address_from_sig_script(sig_script, network) {
            Ok(address) if watched.controls(&address) => return true,
            Ok(_) => {}
            Err(e) if is_malformed(&e) => *warnings += 1,
            Err(_) => {}
        }
    }
    false
}

fn outputs_relevant<W: WatchedSet + ?Sized>(
    tx: &Transaction,
    watched: &W,
    network: Network,
    warnings: &mut u32,
) -> bool {
    for output in &tx.outputs {
        match script::extract_addresses(&output.pk_script, network) {
            Ok(extracted) => {
                if extracted.class == ScriptClass::NullData {
                    continue;
                }
                if extracted.addresses.iter().any(|a| watched.controls(a)) {
                    return true;
                }
            }
            Err(e) => {
                tracing::debug!("Undecodable output script in {}: {}", tx.tx_hash(), e);
                *warnings += 1;
            }
        }
    }
    false
}
