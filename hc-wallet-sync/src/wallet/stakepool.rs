//! Stake-pool fee rules.

use hc_wire::ChainParams;
use hc_wire::stake::{self, StakeError};

use super::Wallet;
use crate::types::TxRecord;

/// Minimum fee a user must commit to the pool for a ticket bought at
/// `stake_diff` with `relay_fee` in transaction fees.
///
/// `pool_fee` is a percentage (1.5 means 1.5%). The vote subsidy is
/// projected forward by the number of reduction intervals a ticket takes,
/// on average, to vote.
pub fn stake_pool_ticket_fee(
    stake_diff: i64,
    relay_fee: i64,
    height: u32,
    pool_fee: f64,
    params: &ChainParams,
) -> i64 {
    let pool_fee_int = (pool_fee * 100.0).floor() as i128;

    let interval = params.subsidy_reduction_interval.max(1);
    let adjustments = (params.ticket_pool_size as i64 + interval - 1) / interval;
    let mut subsidy = params.stake_vote_subsidy(height as i64);
    for _ in 0..adjustments {
        subsidy = subsidy * params.mul_subsidy / params.div_subsidy;
    }

    let s = subsidy as i128;
    let v = stake_diff as i128;
    let z = relay_fee as i128;
    let denominator = (s + v) * 10_000;
    if denominator == 0 {
        return 0;
    }
    (pool_fee_int * s * (v + z) / denominator) as i64
}

impl Wallet {
    /// Checks a user ticket's first commitment against the pool's cold
    /// addresses and fee.
    pub(crate) fn evaluate_stake_pool_ticket(&self, rec: &TxRecord, height: u32) -> Result<bool, StakeError> {
        let tx = &rec.tx;
        let commitment = tx.outputs.get(1).ok_or(StakeError::NotCommitment)?;
        let commit_addr = stake::commitment_address(&commitment.pk_script, self.config.network)?;

        let mut committed = 0i64;
        for output in tx.outputs.iter().skip(1).step_by(2) {
            committed += stake::commitment_amount(&output.pk_script)?;
        }
        let spent: i64 = tx.outputs.iter().map(|output| output.value).sum();
        let fees = committed - spent;

        if !self.cold_addresses.contains(&commit_addr) {
            tracing::warn!("Unknown pool commitment address {} for ticket {}", commit_addr, rec.hash);
            return Ok(false);
        }

        let commit_amount = stake::commitment_amount(&commitment.pk_script)?;
        let ticket_value = tx.outputs.first().map(|output| output.value).unwrap_or(0);
        let fee_needed = stake_pool_ticket_fee(ticket_value, fees, height, self.config.pool_fees, self.params);
        if commit_amount < fee_needed {
            tracing::warn!(
                "User submitted ticket {} which has less fees than are required to use this stake pool and is being skipped (required: {}, found {})",
                rec.hash,
                fee_needed,
                commit_amount
            );
            return Ok(false);
        }

        tracing::debug!("Accepted valid stake pool ticket {} committing {} in fees", rec.hash, commit_amount);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletConfig;
    use crate::storage::LedgerStore;
    use crate::test_utils::pool_ticket;
    use hc_wire::{Address, Network};

    const NET: Network = Network::Simnet;

    #[test]
    fn test_fee_scales_with_pool_percentage() {
        let params = NET.params();
        let one = stake_pool_ticket_fee(2_000_000_000, 10_000, 200, 1.0, params);
        let two = stake_pool_ticket_fee(2_000_000_000, 10_000, 200, 2.0, params);
        assert!(one > 0);
        assert!((two - 2 * one).abs() <= 1);
        assert_eq!(stake_pool_ticket_fee(2_000_000_000, 10_000, 200, 0.0, params), 0);
    }

    #[test]
    fn test_fee_matches_closed_form() {
        let params = NET.params();
        let height = 300u32;
        // ceil(64 / 128) = one adjustment.
        let s = params.stake_vote_subsidy(height as i64) * 100 / 101;
        let (v, z) = (5_000_000_000i64, 20_000i64);
        let expected = (750i128 * s as i128 * (v + z) as i128 / ((s as i128 + v as i128) * 10_000)) as i64;
        assert_eq!(stake_pool_ticket_fee(v, z, height, 7.5, params), expected);
    }

    fn pool_wallet(cold: Address) -> Wallet {
        let config = WalletConfig::simnet().with_stake_pool(5.0, vec![cold]);
        Wallet::new(config, LedgerStore::in_memory()).unwrap()
    }

    #[test]
    fn test_ticket_paying_pool_fee_is_accepted() {
        let cold = Address::p2pkh([0xc0; 20], NET);
        let wallet = pool_wallet(cold);
        let fee = stake_pool_ticket_fee(1_000_000_000, 50_000, 200, 5.0, NET.params());

        let ticket = pool_ticket(&Address::p2pkh([1; 20], NET), &cold, fee, 1_000_000_000, 50_000);
        let rec = TxRecord::from_tx(ticket, 0);
        assert!(wallet.evaluate_stake_pool_ticket(&rec, 200).unwrap());
    }

    #[test]
    fn test_ticket_below_pool_fee_is_rejected() {
        let cold = Address::p2pkh([0xc0; 20], NET);
        let wallet = pool_wallet(cold);
        let fee = stake_pool_ticket_fee(1_000_000_000, 50_000, 200, 5.0, NET.params());

        let ticket = pool_ticket(&Address::p2pkh([1; 20], NET), &cold, fee - 1, 1_000_000_000, 50_000);
        let rec = TxRecord::from_tx(ticket, 0);
        assert!(!wallet.evaluate_stake_pool_ticket(&rec, 200).unwrap());
    }

    #[test]
    fn test_unknown_commitment_address_is_rejected() {
        let wallet = pool_wallet(Address::p2pkh([0xc0; 20], NET));
        let ticket = pool_ticket(
            &Address::p2pkh([1; 20], NET),
            &Address::p2pkh([0xee; 20], NET),
            1_000_000,
            1_000_000_000,
            50_000,
        );
        assert!(!wallet.evaluate_stake_pool_ticket(&TxRecord::from_tx(ticket, 0), 200).unwrap());
    }
}
