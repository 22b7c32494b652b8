//! Script parsing, classification and construction.

use thiserror::Error;

use crate::address::Address;
use crate::hash::hash160;
use crate::network::Network;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_DATA_20: u8 = 0x14;
    pub const OP_DATA_30: u8 = 0x1e;
    pub const OP_DATA_33: u8 = 0x21;
    pub const OP_DATA_36: u8 = 0x24;
    pub const OP_DATA_65: u8 = 0x41;
    pub const OP_DATA_75: u8 = 0x4b;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_SSTX: u8 = 0xba;
    pub const OP_SSGEN: u8 = 0xbb;
    pub const OP_SSRTX: u8 = 0xbc;
    pub const OP_SSTXCHANGE: u8 = 0xbd;
}

use opcodes::*;

/// Largest push accepted in a null-data output.
pub const MAX_DATA_CARRIER_SIZE: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("push at offset {0} runs past the end of the script")]
    Truncated(usize),

    #[error("script contains non-push opcode {0:#04x}")]
    NotPushOnly(u8),

    #[error("empty signature script")]
    EmptySigScript,

    #[error("signature script does not redeem a known template")]
    UnknownSigScript,

    #[error("script is not a stake output")]
    NotStakeOutput,
}

/// Standard script templates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ScriptClass {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    NullData,
    StakeSubmission,
    StakeGen,
    StakeRevocation,
    StakeSubChange,
}

impl ScriptClass {
    pub fn is_stake(self) -> bool {
        matches!(
            self,
            ScriptClass::StakeSubmission
                | ScriptClass::StakeGen
                | ScriptClass::StakeRevocation
                | ScriptClass::StakeSubChange
        )
    }
}

/// A single parsed instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes, for push opcodes.
    pub data: Option<&'a [u8]>,
}

/// Splits a script into instructions.
pub fn parse(script: &[u8]) -> Result<Vec<Instruction<'_>>, ScriptError> {
    let mut ops = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let opcode = script[i];
        let start = i;
        i += 1;
        let push_len = match opcode {
            0x01..=OP_DATA_75 => Some(opcode as usize),
            OP_PUSHDATA1 => {
                let n = *script.get(i).ok_or(ScriptError::Truncated(start))? as usize;
                i += 1;
                Some(n)
            }
            OP_PUSHDATA2 => {
                let b = script.get(i..i + 2).ok_or(ScriptError::Truncated(start))?;
                i += 2;
                Some(u16::from_le_bytes([b[0], b[1]]) as usize)
            }
            OP_PUSHDATA4 => {
                let b = script.get(i..i + 4).ok_or(ScriptError::Truncated(start))?;
                i += 4;
                Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            }
            _ => None,
        };
        let data = match push_len {
            Some(n) => {
                let end = i.checked_add(n).ok_or(ScriptError::Truncated(start))?;
                let bytes = script.get(i..end).ok_or(ScriptError::Truncated(start))?;
                i = end;
                Some(bytes)
            }
            None if opcode == OP_0 => Some(&script[i..i]),
            None => None,
        };
        ops.push(Instruction {
            opcode,
            data,
        });
    }
    Ok(ops)
}

/// Returns the pushed data of a push-only script.
pub fn push_data(script: &[u8]) -> Result<Vec<&[u8]>, ScriptError> {
    parse(script)?
        .into_iter()
        .map(|op| match op.data {
            Some(data) => Ok(data),
            None if (OP_1NEGATE..=OP_16).contains(&op.opcode) => Ok(&[][..]),
            None => Err(ScriptError::NotPushOnly(op.opcode)),
        })
        .collect()
}

fn small_int(opcode: u8) -> Option<usize> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some((opcode - OP_1 + 1) as usize),
        _ => None,
    }
}

fn is_pubkey(data: &[u8]) -> bool {
    matches!((data.len(), data.first()), (33, Some(0x02 | 0x03)) | (65, Some(0x04)))
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == OP_DATA_20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == OP_DATA_20 && script[22] == OP_EQUAL
}

fn multisig_shape(script: &[u8]) -> Option<(usize, Vec<&[u8]>)> {
    let ops = parse(script).ok()?;
    if ops.len() < 4 || ops.last()?.opcode != OP_CHECKMULTISIG {
        return None;
    }
    let required = small_int(ops[0].opcode).filter(|m| *m > 0)?;
    let total = small_int(ops[ops.len() - 2].opcode)?;
    let keys: Vec<&[u8]> = ops[1..ops.len() - 2].iter().filter_map(|op| op.data).collect();
    if keys.len() != ops.len() - 3 || keys.len() != total || required > total {
        return None;
    }
    if !keys.iter().all(|k| is_pubkey(k)) {
        return None;
    }
    Some((required, keys))
}

fn is_null_data(script: &[u8]) -> bool {
    if script.first() != Some(&OP_RETURN) {
        return false;
    }
    if script.len() == 1 {
        return true;
    }
    match parse(&script[1..]) {
        Ok(ops) => {
            ops.len() == 1
                && ops[0].data.map(|d| d.len() <= MAX_DATA_CARRIER_SIZE).unwrap_or(false)
        }
        Err(_) => false,
    }
}

/// Classifies an output script.
pub fn classify(script: &[u8]) -> ScriptClass {
    if is_p2pkh(script) {
        return ScriptClass::PubKeyHash;
    }
    if is_p2sh(script) {
        return ScriptClass::ScriptHash;
    }
    if let Some((&tag, rest)) = script.split_first() {
        let tagged = is_p2pkh(rest) || is_p2sh(rest);
        match tag {
            OP_SSTX if tagged => return ScriptClass::StakeSubmission,
            OP_SSGEN if tagged => return ScriptClass::StakeGen,
            OP_SSRTX if tagged => return ScriptClass::StakeRevocation,
            OP_SSTXCHANGE if tagged => return ScriptClass::StakeSubChange,
            _ => {}
        }
    }
    if (script.len() == 35 || script.len() == 67)
        && script[0] as usize == script.len() - 2
        && script[script.len() - 1] == OP_CHECKSIG
        && is_pubkey(&script[1..script.len() - 1])
    {
        return ScriptClass::PubKey;
    }
    if multisig_shape(script).is_some() {
        return ScriptClass::MultiSig;
    }
    if is_null_data(script) {
        return ScriptClass::NullData;
    }
    ScriptClass::NonStandard
}

/// Class of the payment wrapped by a stake-tagged output.
pub fn stake_out_subclass(script: &[u8]) -> Result<ScriptClass, ScriptError> {
    if !classify(script).is_stake() {
        return Err(ScriptError::NotStakeOutput);
    }
    match classify(&script[1..]) {
        class @ (ScriptClass::PubKeyHash | ScriptClass::ScriptHash) => Ok(class),
        _ => Err(ScriptError::NotStakeOutput),
    }
}

/// Addresses paid by an output script.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExtractedAddresses {
    pub class: ScriptClass,
    pub addresses: Vec<Address>,
    pub required_sigs: usize,
}

/// Extracts the class and addresses of an output script.
///
/// Public keys are reported as the pay-to-pubkey-hash address of the key.
/// Malformed push data is an error; a well-formed script that matches no
/// template is reported as [`ScriptClass::NonStandard`] with no addresses.
pub fn extract_addresses(
    script: &[u8],
    network: Network,
) -> Result<ExtractedAddresses, ScriptError> {
    parse(script)?;
    let class = classify(script);
    let payload = if class.is_stake() {
        &script[1..]
    } else {
        script
    };
    let (addresses, required_sigs) = match class {
        ScriptClass::PubKeyHash => (vec![p2pkh_from_script(payload, network)], 1),
        ScriptClass::ScriptHash => (vec![p2sh_from_script(payload, network)], 1),
        ScriptClass::StakeSubmission
        | ScriptClass::StakeGen
        | ScriptClass::StakeRevocation
        | ScriptClass::StakeSubChange => {
            if is_p2pkh(payload) {
                (vec![p2pkh_from_script(payload, network)], 1)
            } else {
                (vec![p2sh_from_script(payload, network)], 1)
            }
        }
        ScriptClass::PubKey => (vec![Address::from_pubkey(&script[1..script.len() - 1], network)], 1),
        ScriptClass::MultiSig => match multisig_shape(script) {
            Some((required, keys)) => {
                (keys.iter().map(|k| Address::from_pubkey(k, network)).collect(), required)
            }
            None => (Vec::new(), 0),
        },
        ScriptClass::NullData | ScriptClass::NonStandard => (Vec::new(), 0),
    };
    Ok(ExtractedAddresses {
        class,
        addresses,
        required_sigs,
    })
}

fn p2pkh_from_script(script: &[u8], network: Network) -> Address {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[3..23]);
    Address::p2pkh(hash, network)
}

fn p2sh_from_script(script: &[u8], network: Network) -> Address {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    Address::p2sh(hash, network)
}

/// True when the signature script's final push is a multisig redeem script.
pub fn is_multisig_sig_script(sig_script: &[u8]) -> bool {
    match push_data(sig_script) {
        Ok(pushes) => pushes
            .last()
            .map(|last| !last.is_empty() && classify(last) == ScriptClass::MultiSig)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Extracts the redeem script from a multisig redemption.
pub fn multisig_redeem_script_from_sig_script(sig_script: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let pushes = push_data(sig_script)?;
    let last = pushes.last().ok_or(ScriptError::EmptySigScript)?;
    if classify(last) != ScriptClass::MultiSig {
        return Err(ScriptError::UnknownSigScript);
    }
    Ok(last.to_vec())
}

/// Address whose output a signature script redeems.
///
/// A final push that is a public key identifies a pay-to-pubkey-hash
/// spend; a final push that parses as a standard script identifies a
/// pay-to-script-hash spend.
pub fn address_from_sig_script(sig_script: &[u8], network: Network) -> Result<Address, ScriptError> {
    let pushes = push_data(sig_script)?;
    let last = pushes.last().ok_or(ScriptError::EmptySigScript)?;
    if is_pubkey(last) {
        return Ok(Address::from_pubkey(last, network));
    }
    if !last.is_empty() && classify(last) != ScriptClass::NonStandard {
        return Ok(Address::from_redeem_script(last, network));
    }
    Err(ScriptError::UnknownSigScript)
}

/// Appends a minimal push of `data` to `script`.
pub fn push_bytes(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        n if n <= OP_DATA_75 as usize => script.push(n as u8),
        n if n <= u8::MAX as usize => {
            script.push(OP_PUSHDATA1);
            script.push(n as u8);
        }
        n if n <= u16::MAX as usize => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_DATA_20]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn pay_to_script_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, OP_DATA_20]);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

/// A payment to `address` tagged with a stake opcode.
pub fn stake_tagged(tag: u8, address: &Address) -> Vec<u8> {
    let mut script = vec![tag];
    script.extend(address.script_pubkey());
    script
}

pub fn null_data(data: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    push_bytes(&mut script, data);
    script
}

/// An m-of-n multisig script over the given public keys.
pub fn multisig(required: u8, pubkeys: &[&[u8]]) -> Vec<u8> {
    let mut script = vec![OP_1 + required - 1];
    for key in pubkeys {
        push_bytes(&mut script, key);
    }
    script.push(OP_1 + pubkeys.len() as u8 - 1);
    script.push(OP_CHECKMULTISIG);
    script
}

/// Signature script redeeming a P2SH multisig output with placeholder
/// signatures.
pub fn multisig_sig_script(signatures: &[&[u8]], redeem_script: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_0];
    for sig in signatures {
        push_bytes(&mut script, sig);
    }
    push_bytes(&mut script, redeem_script);
    script
}

/// Signature script redeeming a P2PKH output.
pub fn p2pkh_sig_script(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    push_bytes(&mut script, signature);
    push_bytes(&mut script, pubkey);
    script
}

/// Hash160 of a redeem script.
pub fn script_hash(script: &[u8]) -> [u8; 20] {
    hash160(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Vec<u8> {
        let mut k = vec![0x02];
        k.extend_from_slice(&[byte; 32]);
        k
    }

    #[test]
    fn standard_templates_classify() {
        let addr = Address::p2pkh([9u8; 20], Network::Simnet);
        assert_eq!(classify(&addr.script_pubkey()), ScriptClass::PubKeyHash);
        assert_eq!(classify(&pay_to_script_hash(&[1u8; 20])), ScriptClass::ScriptHash);
        assert_eq!(classify(&stake_tagged(OP_SSTX, &addr)), ScriptClass::StakeSubmission);
        assert_eq!(classify(&stake_tagged(OP_SSGEN, &addr)), ScriptClass::StakeGen);
        assert_eq!(classify(&stake_tagged(OP_SSRTX, &addr)), ScriptClass::StakeRevocation);
        assert_eq!(classify(&stake_tagged(OP_SSTXCHANGE, &addr)), ScriptClass::StakeSubChange);
        assert_eq!(classify(&null_data(b"hello")), ScriptClass::NullData);
        assert_eq!(classify(&[0xff, 0xfe]), ScriptClass::NonStandard);
    }

    #[test]
    fn multisig_extracts_every_key() {
        let (k1, k2) = (key(1), key(2));
        let script = multisig(1, &[&k1, &k2]);
        let extracted = extract_addresses(&script, Network::Simnet).unwrap();
        assert_eq!(extracted.class, ScriptClass::MultiSig);
        assert_eq!(extracted.required_sigs, 1);
        assert_eq!(extracted.addresses, vec![
            Address::from_pubkey(&k1, Network::Simnet),
            Address::from_pubkey(&k2, Network::Simnet)
        ]);
    }

    #[test]
    fn stake_tagged_extracts_inner_address() {
        let addr = Address::p2sh([4u8; 20], Network::Testnet);
        let script = stake_tagged(OP_SSGEN, &addr);
        let extracted = extract_addresses(&script, Network::Testnet).unwrap();
        assert_eq!(extracted.addresses, vec![addr]);
        assert_eq!(stake_out_subclass(&script), Ok(ScriptClass::ScriptHash));
        assert_eq!(stake_out_subclass(&addr.script_pubkey()), Err(ScriptError::NotStakeOutput));
    }

    #[test]
    fn truncated_push_is_an_error() {
        assert_eq!(parse(&[0x05, 0x01]), Err(ScriptError::Truncated(0)));
        assert!(extract_addresses(&[0x05, 0x01], Network::Mainnet).is_err());
    }

    #[test]
    fn sig_script_addresses() {
        let pk = key(7);
        let sig = p2pkh_sig_script(&[0x30; 71], &pk);
        assert_eq!(
            address_from_sig_script(&sig, Network::Simnet).unwrap(),
            Address::from_pubkey(&pk, Network::Simnet)
        );

        let redeem = multisig(1, &[&pk]);
        let ms_sig = multisig_sig_script(&[&[0x30; 71]], &redeem);
        assert!(is_multisig_sig_script(&ms_sig));
        assert_eq!(multisig_redeem_script_from_sig_script(&ms_sig).unwrap(), redeem);
        assert_eq!(
            address_from_sig_script(&ms_sig, Network::Simnet).unwrap(),
            Address::from_redeem_script(&redeem, Network::Simnet)
        );

        assert_eq!(
            address_from_sig_script(&[OP_RETURN], Network::Simnet),
            Err(ScriptError::NotPushOnly(OP_RETURN))
        );
    }
}
