// Pool of validated, unconfirmed transactions

mod pool;

pub use pool::{Mempool, MempoolEntry, SubmitStatus};
