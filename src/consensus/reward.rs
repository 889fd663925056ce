// Block reward schedule

use crate::config::ChainParams;

/// Halvings after which the subsidy is zero
const MAX_HALVINGS: u64 = 64;

/// New coins a coinbase at `height` may create
pub fn block_subsidy(params: &ChainParams, height: u64) -> u64 {
    let halvings = height / params.halving_interval as u64;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    params.initial_subsidy >> halvings
}
