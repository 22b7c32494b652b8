//! Address namespace: managed addresses, their usage, and imported scripts.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use hc_wire::script::{self, ScriptClass};
use hc_wire::{Address, AddressKind, Network, Transaction};

use crate::error::{StorageError, StorageResult};

/// Account number reported for imported scripts.
pub const IMPORTED_ACCOUNT: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedAddress {
    pub address: Address,
    pub account: u32,
    /// Change branch.
    pub internal: bool,
    pub index: u32,
    pub used: bool,
}

/// Highest used child index per branch of an account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUsage {
    pub last_used_external: Option<u32>,
    pub last_used_internal: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressIndex {
    addresses: HashMap<Address, ManagedAddress>,
    accounts: BTreeMap<u32, AccountUsage>,
    scripts: HashMap<[u8; 20], Vec<u8>>,
}

impl AddressIndex {
    /// Registers a derived address of `account`.
    pub fn insert_address(
        &mut self,
        address: Address,
        account: u32,
        internal: bool,
        index: u32,
    ) -> StorageResult<()> {
        if self.addresses.contains_key(&address) {
            return Err(StorageError::Duplicate(format!("address {address}")));
        }
        self.addresses.insert(
            address,
            ManagedAddress {
                address,
                account,
                internal,
                index,
                used: false,
            },
        );
        self.accounts.entry(account).or_default();
        Ok(())
    }

    pub fn address(&self, address: &Address) -> StorageResult<&ManagedAddress> {
        self.addresses
            .get(address)
            .ok_or_else(|| StorageError::NotFound(format!("address {address} is not managed")))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains_key(address)
    }

    /// Marks an address used. Returns true the first time.
    pub fn mark_used(&mut self, address: &Address) -> StorageResult<bool> {
        let managed = self
            .addresses
            .get_mut(address)
            .ok_or_else(|| StorageError::NotFound(format!("address {address} is not managed")))?;
        if managed.used {
            return Ok(false);
        }
        managed.used = true;

        if managed.account != IMPORTED_ACCOUNT {
            let usage = self.accounts.entry(managed.account).or_default();
            let last = if managed.internal {
                &mut usage.last_used_internal
            } else {
                &mut usage.last_used_external
            };
            if last.is_none_or(|last| last < managed.index) {
                *last = Some(managed.index);
            }
        }
        Ok(true)
    }

    pub fn account_usage(&self, account: u32) -> Option<AccountUsage> {
        self.accounts.get(&account).copied()
    }

    /// Imports a redeem script and watches its pay-to-script-hash address.
    pub fn import_script(&mut self, redeem_script: &[u8], network: Network) -> StorageResult<Address> {
        let hash = script::script_hash(redeem_script);
        if self.scripts.contains_key(&hash) {
            return Err(StorageError::Duplicate(format!("script {}", hex::encode(hash))));
        }
        let address = Address::p2sh(hash, network);
        self.scripts.insert(hash, redeem_script.to_vec());
        self.addresses.entry(address).or_insert(ManagedAddress {
            address,
            account: IMPORTED_ACCOUNT,
            internal: false,
            index: 0,
            used: false,
        });
        Ok(address)
    }

    pub fn redeem_script(&self, script_hash: &[u8; 20]) -> Option<&[u8]> {
        self.scripts.get(script_hash).map(Vec::as_slice)
    }

    /// True when the wallet controls the address a ticket's stake submission
    /// output pays to.
    ///
    /// A pay-to-script-hash voting address counts when its redeem script is
    /// a multisig including at least one managed key.
    pub fn has_voting_authority(&self, ticket: &Transaction, network: Network) -> bool {
        let Some(submission) = ticket.outputs.first() else {
            return false;
        };
        let Ok(extracted) = script::extract_addresses(&submission.pk_script, network) else {
            return false;
        };
        extracted.addresses.iter().any(|address| match address.kind() {
            AddressKind::PubKeyHash => self.contains(address),
            AddressKind::ScriptHash => self.redeem_script(address.hash160()).is_some_and(|redeem| {
                script::extract_addresses(redeem, network).is_ok_and(|ms| {
                    ms.class == ScriptClass::MultiSig
                        && ms.addresses.iter().any(|key| self.contains(key))
                })
            }),
        })
    }

    /// Every managed address, sorted, for the node's transaction filter.
    pub fn watched_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<_> = self.addresses.keys().copied().collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_wire::script::opcodes::OP_SSTX;
    use hc_wire::{OutPoint, TxHash, TxIn, TxOut, TxTree};

    const NET: Network = Network::Simnet;

    fn pubkey(fill: u8) -> [u8; 33] {
        let mut key = [fill; 33];
        key[0] = 0x02;
        key
    }

    fn ticket_paying(voting: &Address) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(OutPoint::new(TxHash::hash(b"in"), 0, TxTree::Regular)));
        tx.outputs.push(TxOut::new(100, script::stake_tagged(OP_SSTX, voting)));
        tx
    }

    #[test]
    fn test_mark_used_tracks_branches() {
        let mut index = AddressIndex::default();
        let a = Address::p2pkh([1; 20], NET);
        let b = Address::p2pkh([2; 20], NET);
        index.insert_address(a, 0, false, 3).unwrap();
        index.insert_address(b, 0, true, 1).unwrap();
        assert!(index.insert_address(a, 0, false, 3).unwrap_err().is_duplicate());

        assert!(index.mark_used(&a).unwrap());
        assert!(!index.mark_used(&a).unwrap());
        index.mark_used(&b).unwrap();

        let usage = index.account_usage(0).unwrap();
        assert_eq!(usage.last_used_external, Some(3));
        assert_eq!(usage.last_used_internal, Some(1));
        assert!(index.mark_used(&Address::p2pkh([9; 20], NET)).is_err());
    }

    #[test]
    fn test_imported_script_is_watched() {
        let mut index = AddressIndex::default();
        let redeem = script::multisig(1, &[&pubkey(2)[..], &pubkey(3)[..]]);
        let address = index.import_script(&redeem, NET).unwrap();
        assert!(index.import_script(&redeem, NET).unwrap_err().is_duplicate());

        let managed = index.address(&address).unwrap();
        assert_eq!(managed.account, IMPORTED_ACCOUNT);
        assert_eq!(index.redeem_script(address.hash160()), Some(redeem.as_slice()));
        assert!(index.watched_addresses().contains(&address));
    }

    #[test]
    fn test_voting_authority() {
        let mut index = AddressIndex::default();
        let owned = Address::p2pkh([5; 20], NET);
        index.insert_address(owned, 0, false, 0).unwrap();
        assert!(index.has_voting_authority(&ticket_paying(&owned), NET));
        assert!(!index.has_voting_authority(&ticket_paying(&Address::p2pkh([6; 20], NET)), NET));

        let our_key = pubkey(7);
        index.insert_address(Address::from_pubkey(&our_key, NET), 0, false, 1).unwrap();
        let redeem = script::multisig(1, &[&our_key[..], &pubkey(8)[..]]);
        let pool_address = index.import_script(&redeem, NET).unwrap();
        assert!(index.has_voting_authority(&ticket_paying(&pool_address), NET));
    }
}
