// Proof of Work implementation

use crate::consensus::ValidationError;
use crate::core::{BlockHeader, Hash256};
use primitive_types::U256;
use std::time::{Duration, Instant};

/// Nonces tried between cancellation checks
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Difficulty target representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Compact representation (bits field in block header)
    pub bits: u32,
}

impl Target {
    /// Create a new target from bits (compact format)
    pub fn from_bits(bits: u32) -> Self {
        Self { bits }
    }

    /// Convert compact bits to the full 256-bit target.
    /// Formula: target = mantissa * 256^(exponent - 3)
    ///
    /// Negative, overflowing and zero targets are rejected.
    pub fn to_u256(&self) -> Result<U256, ValidationError> {
        let exponent = self.bits >> 24;
        let mantissa = self.bits & 0x007fffff;

        if mantissa != 0 && self.bits & 0x00800000 != 0 {
            return Err(ValidationError::InvalidTarget(self.bits));
        }
        let overflow = mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32));
        if overflow {
            return Err(ValidationError::InvalidTarget(self.bits));
        }

        let value = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            U256::from(mantissa) << (8 * (exponent - 3) as usize)
        };

        if value.is_zero() {
            return Err(ValidationError::InvalidTarget(self.bits));
        }
        Ok(value)
    }

    /// Encode a 256-bit target in compact form (rounds down)
    pub fn from_u256(value: U256) -> Self {
        let mut size = (value.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (value.low_u64() << (8 * (3 - size))) as u32
        } else {
            (value >> (8 * (size - 3))).low_u32()
        };

        // keep the sign bit clear
        if compact & 0x00800000 != 0 {
            compact >>= 8;
            size += 1;
        }

        Self::from_bits(compact | ((size as u32) << 24))
    }

    /// Check if a hash meets this target (hash <= target)
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        match self.to_u256() {
            Ok(target) => hash.to_u256() <= target,
            Err(_) => false,
        }
    }

    /// Expected number of hashes to meet this target: 2^256 / (target + 1)
    pub fn work(&self) -> U256 {
        match self.to_u256() {
            Ok(target) => work_for(target),
            Err(_) => U256::zero(),
        }
    }

    /// Count leading zero bits in target (difficulty indicator)
    pub fn leading_zeros(&self) -> u32 {
        match self.to_u256() {
            Ok(target) => target.leading_zeros(),
            Err(_) => 256,
        }
    }
}

fn work_for(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::one();
    }
    // 2^256 does not fit; (~target / (target + 1)) + 1 is the same quotient
    (!target / (target + U256::one())) + U256::one()
}

/// Check a header's hash against its own bits and the network limit
pub fn check_proof_of_work(header: &BlockHeader, pow_limit_bits: u32) -> Result<(), ValidationError> {
    let target = Target::from_bits(header.bits).to_u256()?;
    let limit = Target::from_bits(pow_limit_bits).to_u256()?;
    if target > limit {
        return Err(ValidationError::InvalidTarget(header.bits));
    }
    if header.hash().to_u256() > target {
        return Err(ValidationError::InvalidProofOfWork);
    }
    Ok(())
}

/// How a nonce search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningOutcome {
    Found,
    /// The caller asked the search to stop
    Cancelled,
    /// Attempt budget used up without a solution
    Exhausted,
}

/// Proof of Work miner
pub struct Miner {
    pub target: Target,
    /// Expanded target for fast comparison
    target_value: U256,
}

impl Miner {
    /// Create a miner for a compact target
    pub fn new(bits: u32) -> Result<Self, ValidationError> {
        let target = Target::from_bits(bits);
        let target_value = target.to_u256()?;
        Ok(Self {
            target,
            target_value,
        })
    }

    /// Search nonces until the header meets the target or `should_stop` returns true.
    ///
    /// `should_stop` is polled every `CANCEL_CHECK_INTERVAL` attempts. When the
    /// nonce space is exhausted the timestamp is bumped and the search restarts.
    pub fn mine<F: Fn() -> bool>(&self, header: &mut BlockHeader, should_stop: F) -> MiningResult {
        let start_time = Instant::now();
        let mut attempts = 0u64;
        header.nonce = 0;

        loop {
            let hash = header.hash();
            attempts += 1;

            if hash.to_u256() <= self.target_value {
                return MiningResult::new(MiningOutcome::Found, header.nonce, hash, attempts, start_time.elapsed());
            }

            if attempts % CANCEL_CHECK_INTERVAL == 0 && should_stop() {
                log::debug!("Mining cancelled after {} attempts", attempts);
                return MiningResult::new(MiningOutcome::Cancelled, header.nonce, hash, attempts, start_time.elapsed());
            }

            if header.nonce == u32::MAX {
                header.timestamp = header.timestamp.wrapping_add(1);
                header.nonce = 0;
                log::debug!("Nonce space exhausted, timestamp bumped to {}", header.timestamp);
            } else {
                header.nonce += 1;
            }
        }
    }

    /// Deterministic bounded search starting at `start_nonce`
    pub fn mine_range(&self, header: &mut BlockHeader, start_nonce: u32, max_attempts: u64) -> MiningResult {
        let start_time = Instant::now();
        let mut nonce = start_nonce;

        for attempt in 1..=max_attempts {
            header.nonce = nonce;
            let hash = header.hash();
            if hash.to_u256() <= self.target_value {
                return MiningResult::new(MiningOutcome::Found, nonce, hash, attempt, start_time.elapsed());
            }
            nonce = nonce.wrapping_add(1);
        }

        MiningResult::new(MiningOutcome::Exhausted, header.nonce, Hash256::zero(), max_attempts, start_time.elapsed())
    }

    /// Verify that a block header satisfies PoW
    pub fn verify(&self, header: &BlockHeader) -> bool {
        header.hash().to_u256() <= self.target_value
    }
}

/// Mining result
#[derive(Debug, Clone)]
pub struct MiningResult {
    pub outcome: MiningOutcome,
    /// Last nonce tried (the solution when found)
    pub nonce: u32,
    pub hash: Hash256,
    /// Number of attempts
    pub attempts: u64,
    /// Time taken
    pub duration: Duration,
}

impl MiningResult {
    fn new(outcome: MiningOutcome, nonce: u32, hash: Hash256, attempts: u64, duration: Duration) -> Self {
        Self {
            outcome,
            nonce,
            hash,
            attempts,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == MiningOutcome::Found
    }

    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.attempts as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn header(bits: u32) -> BlockHeader {
        BlockHeader::new(1, Hash256::new([7; 32]), Hash256::new([9; 32]), 1_700_000_000, bits, 0)
    }

    #[test]
    fn test_target_conversion() {
        let target = Target::from_bits(0x1d00ffff).to_u256().unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208);

        let small = Target::from_bits(0x03123456).to_u256().unwrap();
        assert_eq!(small, U256::from(0x123456u64));
        let shifted = Target::from_bits(0x02123456).to_u256().unwrap();
        assert_eq!(shifted, U256::from(0x1234u64));
    }

    #[test]
    fn test_compact_roundtrip() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1f00ffff, 0x1b0404cb, 0x2000ffff] {
            let value = Target::from_bits(bits).to_u256().unwrap();
            assert_eq!(Target::from_u256(value).bits, bits, "bits {:08x}", bits);
        }
    }

    #[test]
    fn test_compact_encoding_avoids_sign_bit() {
        let value = U256::from(0x80u64);
        let target = Target::from_u256(value);
        assert_eq!(target.bits, 0x02008000);
        assert_eq!(target.to_u256().unwrap(), value);
    }

    #[test]
    fn test_invalid_compact_rejected() {
        // sign bit set
        assert!(Target::from_bits(0x04923456).to_u256().is_err());
        // overflow
        assert!(Target::from_bits(0xff123456).to_u256().is_err());
        assert!(Target::from_bits(0x22010000).to_u256().is_err());
        // zero
        assert!(Target::from_bits(0x1d000000).to_u256().is_err());
    }

    #[test]
    fn test_target_validation() {
        let target = Target::from_bits(0x1d00ffff);
        assert!(target.is_met_by(&Hash256::zero()));
        assert!(!target.is_met_by(&Hash256::new([0xff; 32])));
    }

    #[test]
    fn test_work_grows_with_difficulty() {
        let easy = Target::from_bits(0x207fffff).work();
        let hard = Target::from_bits(0x1f00ffff).work();
        assert!(hard > easy);
        assert_eq!(easy, U256::from(2u64));

        // a target four times smaller carries four times the work
        let t = Target::from_bits(0x1f00ffff).to_u256().unwrap();
        let quarter = Target::from_u256(t / 4);
        let ratio = quarter.work() / Target::from_bits(0x1f00ffff).work();
        assert_eq!(ratio, U256::from(4u64));
    }

    #[test]
    fn test_seeded_mining_vector() {
        // roughly 2^8 attempts per solution
        let miner = Miner::new(0x2000ffff).unwrap();
        let mut first = header(0x2000ffff);
        let result = miner.mine_range(&mut first, 0, 20_000);

        assert!(result.success());
        assert!(result.attempts <= 20_000);
        assert!(miner.verify(&first));
        assert!(first.hash().to_u256() <= Target::from_bits(0x2000ffff).to_u256().unwrap());
        assert!(check_proof_of_work(&first, 0x207fffff).is_ok());

        // same header, same seed, same answer
        let mut second = header(0x2000ffff);
        let again = miner.mine_range(&mut second, 0, 20_000);
        assert_eq!(again.nonce, result.nonce);
        assert_eq!(again.hash, result.hash);
    }

    #[test]
    fn test_mine_until_found() {
        let miner = Miner::new(0x207fffff).unwrap();
        let mut h = header(0x207fffff);
        let result = miner.mine(&mut h, || false);
        assert!(result.success());
        assert_eq!(h.nonce, result.nonce);
        assert!(miner.verify(&h));
    }

    #[test]
    fn test_mining_cancellation() {
        // practically unreachable target
        let miner = Miner::new(0x1a00ffff).unwrap();
        let stop = AtomicBool::new(true);
        let mut h = header(0x1a00ffff);
        let result = miner.mine(&mut h, || stop.load(Ordering::Relaxed));
        assert_eq!(result.outcome, MiningOutcome::Cancelled);
        assert_eq!(result.attempts, CANCEL_CHECK_INTERVAL);
    }

    #[test]
    fn test_pow_check_rejects_easier_than_limit() {
        let h = header(0x2100ffff);
        assert!(matches!(
            check_proof_of_work(&h, 0x207fffff),
            Err(ValidationError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Target::from_bits(0x1d00ffff).leading_zeros(), 32);
        assert_eq!(Target::from_bits(0x207fffff).leading_zeros(), 1);
    }
}
