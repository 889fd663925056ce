// Consensus rules: proof of work, difficulty, rewards and validation

pub mod difficulty;
pub mod pow;
pub mod reward;
pub mod validation;

pub use difficulty::retarget;
pub use pow::{check_proof_of_work, Miner, MiningOutcome, MiningResult, Target};
pub use reward::block_subsidy;
pub use validation::{BlockValidator, TransactionValidator, ValidationError, MAX_MONEY};
