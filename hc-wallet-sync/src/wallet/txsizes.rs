//! Worst-case serialized sizes and dust limits used when pricing votes and
//! revocations.

use hc_wire::TxOut;
use hc_wire::encode::VarInt;
use hc_wire::script::{self, ScriptClass};

/// Signature script redeeming a P2PKH output: a data push of up to 73
/// signature bytes and a push of a 33-byte compressed public key.
pub const REDEEM_P2PKH_SIG_SCRIPT_SIZE: usize = 1 + 73 + 1 + 33;

/// Serialized size of an input redeeming a P2PKH output: the 36-byte
/// outpoint, tree, sequence, fraud proof fields and the signature script.
pub const REDEEM_P2PKH_INPUT_SIZE: usize = 32 + 4 + 1 + 4 + 8 + 4 + 4 + 1 + REDEEM_P2PKH_SIG_SCRIPT_SIZE;

/// OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG.
pub const P2PKH_PK_SCRIPT_SIZE: usize = 1 + 1 + 1 + 20 + 1 + 1;

/// Serialized size of a P2PKH output.
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 2 + 1 + P2PKH_PK_SCRIPT_SIZE;

/// Upper bound of a transaction's serialized size with `input_count` P2PKH
/// redemptions and `outputs`, plus a P2PKH change output when `add_change`.
pub fn estimate_serialize_size(input_count: usize, outputs: &[TxOut], add_change: bool) -> usize {
    let mut change_size = 0;
    let mut output_count = outputs.len();
    if add_change {
        change_size = P2PKH_OUTPUT_SIZE;
        output_count += 1;
    }

    // Version and serialization type, lock time, expiry; the prefix and
    // witness each carry an input count.
    12 + 2 * VarInt(input_count as u64).size()
        + VarInt(output_count as u64).size()
        + input_count * REDEEM_P2PKH_INPUT_SIZE
        + outputs.iter().map(TxOut::serialize_size).sum::<usize>()
        + change_size
}

/// Fee for a transaction of `size` bytes at `relay_fee_per_kb`.
pub fn fee_for_serialize_size(relay_fee_per_kb: i64, size: usize) -> i64 {
    let fee = relay_fee_per_kb * size as i64 / 1000;
    if fee == 0 && relay_fee_per_kb > 0 {
        return relay_fee_per_kb;
    }
    fee
}

/// True when spending an output of `amount` with a script of `script_size`
/// bytes would cost more than a third of its value at `relay_fee_per_kb`.
pub fn is_dust_amount(amount: i64, script_size: usize, relay_fee_per_kb: i64) -> bool {
    let total_size = 8 + 2 + VarInt(script_size as u64).size() + script_size + 165;
    amount * 1000 / (3 * total_size as i64) < relay_fee_per_kb
}

/// Data carrier outputs are never dust.
pub fn is_dust_output(output: &TxOut, relay_fee_per_kb: i64) -> bool {
    if script::classify(&output.pk_script) == ScriptClass::NullData {
        return false;
    }
    is_dust_amount(output.value, output.pk_script.len(), relay_fee_per_kb)
}
