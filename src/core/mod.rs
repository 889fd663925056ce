// Core ledger data structures

mod types;
mod transaction;
mod block;
mod serialize;
mod hash;
mod merkle;
pub mod script;

pub use types::*;
pub use transaction::*;
pub use block::*;
pub use serialize::*;
pub use hash::*;
pub use merkle::{merkle_proof, merkle_root, verify_merkle_proof, ProofStep, Side};
pub use script::{evaluate, LockingScript, Script, UnlockingScript};
