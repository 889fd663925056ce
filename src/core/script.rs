// Script model: pay-to-public-key-hash plus the coinbase unlocking form

use crate::core::{hash160, Hash256};
use secp256k1::{Secp256k1, Message, PublicKey, ecdsa::Signature};

/// Largest coinbase unlocking script accepted
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Opcodes for P2PKH script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Duplicate the top stack item
    OpDup = 0x76,
    /// Hash the top stack item with HASH160
    OpHash160 = 0xa9,
    /// Push 20 bytes (pubkey hash size)
    OpPushBytes20 = 0x14,
    /// Verify that the top two items are equal
    OpEqualVerify = 0x88,
    /// Check signature
    OpCheckSig = 0xac,
}

impl OpCode {
    /// Convert byte to opcode
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x76 => Some(OpCode::OpDup),
            0xa9 => Some(OpCode::OpHash160),
            0x14 => Some(OpCode::OpPushBytes20),
            0x88 => Some(OpCode::OpEqualVerify),
            0xac => Some(OpCode::OpCheckSig),
            _ => None,
        }
    }
}

/// Conditions attached to an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingScript {
    /// OP_DUP OP_HASH160 <pubKeyHash> OP_EQUALVERIFY OP_CHECKSIG
    P2pkh([u8; 20]),
}

impl LockingScript {
    /// Parse a scriptPubKey; anything other than the exact P2PKH template is rejected
    pub fn parse(script_pubkey: &[u8]) -> Option<Self> {
        if script_pubkey.len() != 25 {
            return None;
        }
        let template_ok = script_pubkey[0] == OpCode::OpDup as u8
            && script_pubkey[1] == OpCode::OpHash160 as u8
            && script_pubkey[2] == OpCode::OpPushBytes20 as u8
            && script_pubkey[23] == OpCode::OpEqualVerify as u8
            && script_pubkey[24] == OpCode::OpCheckSig as u8;
        if !template_ok {
            return None;
        }

        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&script_pubkey[3..23]);
        Some(LockingScript::P2pkh(pubkey_hash))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            LockingScript::P2pkh(hash) => Script::p2pkh_script_pubkey(hash),
        }
    }

    pub fn pubkey_hash(&self) -> &[u8; 20] {
        match self {
            LockingScript::P2pkh(hash) => hash,
        }
    }
}

/// Data an input supplies to satisfy the output it spends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockingScript {
    /// <sig> <pubkey>
    P2pkh { signature: Vec<u8>, pubkey: Vec<u8> },
    /// Block height commitment followed by a free-form tag
    Coinbase { height: u32, tag: Vec<u8> },
}

impl UnlockingScript {
    /// Parse a spending scriptSig: two length-prefixed pushes and nothing else
    pub fn parse_p2pkh(script_sig: &[u8]) -> Option<Self> {
        let (signature, rest) = split_push(script_sig)?;
        let (pubkey, rest) = split_push(rest)?;
        if !rest.is_empty() || signature.is_empty() || pubkey.is_empty() {
            return None;
        }
        Some(UnlockingScript::P2pkh {
            signature: signature.to_vec(),
            pubkey: pubkey.to_vec(),
        })
    }

    /// Parse a coinbase scriptSig
    pub fn parse_coinbase(script_sig: &[u8]) -> Option<Self> {
        if script_sig.len() < 4 || script_sig.len() > MAX_COINBASE_SCRIPT_LEN {
            return None;
        }
        let mut height = [0u8; 4];
        height.copy_from_slice(&script_sig[..4]);
        Some(UnlockingScript::Coinbase {
            height: u32::from_le_bytes(height),
            tag: script_sig[4..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            UnlockingScript::P2pkh { signature, pubkey } => Script::p2pkh_script_sig(signature, pubkey),
            UnlockingScript::Coinbase { height, tag } => Script::coinbase_script_sig(*height, tag),
        }
    }
}

/// Evaluate an unlocking script against the locking script it claims to satisfy.
/// Pure function; a coinbase unlocking script never satisfies anything.
pub fn evaluate(unlocking: &UnlockingScript, locking: &LockingScript, sighash: &Hash256) -> bool {
    match (unlocking, locking) {
        (UnlockingScript::P2pkh { signature, pubkey }, LockingScript::P2pkh(expected)) => {
            // OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY
            if hash160(pubkey) != *expected {
                return false;
            }
            // OP_CHECKSIG
            verify_signature(signature, pubkey, sighash)
        }
        (UnlockingScript::Coinbase { .. }, _) => false,
    }
}

fn split_push(script: &[u8]) -> Option<(&[u8], &[u8])> {
    let (&len, rest) = script.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Verify ECDSA signature (DER) over a 32-byte digest
fn verify_signature(signature: &[u8], pubkey: &[u8], digest: &Hash256) -> bool {
    let secp = Secp256k1::verification_only();

    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature) else {
        return false;
    };
    let message = Message::from_digest(*digest.as_bytes());

    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// Script builders and byte-level verification entry points
pub struct Script;

impl Script {
    /// Create a P2PKH scriptPubKey
    /// OP_DUP OP_HASH160 <pubKeyHash> OP_EQUALVERIFY OP_CHECKSIG
    pub fn p2pkh_script_pubkey(pubkey_hash: &[u8; 20]) -> Vec<u8> {
        let mut script = Vec::with_capacity(25);
        script.push(OpCode::OpDup as u8);
        script.push(OpCode::OpHash160 as u8);
        script.push(OpCode::OpPushBytes20 as u8);
        script.extend_from_slice(pubkey_hash);
        script.push(OpCode::OpEqualVerify as u8);
        script.push(OpCode::OpCheckSig as u8);
        script
    }

    /// Create a P2PKH scriptSig
    /// <signature> <pubkey>
    pub fn p2pkh_script_sig(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
        let mut script = Vec::with_capacity(2 + signature.len() + pubkey.len());

        // Push signature
        script.push(signature.len() as u8);
        script.extend_from_slice(signature);

        // Push pubkey
        script.push(pubkey.len() as u8);
        script.extend_from_slice(pubkey);

        script
    }

    /// Create a coinbase scriptSig: height (4 bytes LE) + tag
    pub fn coinbase_script_sig(height: u32, tag: &[u8]) -> Vec<u8> {
        let tag = &tag[..tag.len().min(MAX_COINBASE_SCRIPT_LEN - 4)];
        let mut script = Vec::with_capacity(4 + tag.len());
        script.extend_from_slice(&height.to_le_bytes());
        script.extend_from_slice(tag);
        script
    }

    /// P2PKH check from its parts. Fails closed on a malformed locking script,
    /// a public key that does not hash to the commitment, or a bad signature.
    pub fn verify_p2pkh(
        signature: &[u8],
        pubkey: &[u8],
        script_pubkey: &[u8],
        sighash: &Hash256,
    ) -> bool {
        let Some(locking) = LockingScript::parse(script_pubkey) else {
            return false;
        };
        let unlocking = UnlockingScript::P2pkh {
            signature: signature.to_vec(),
            pubkey: pubkey.to_vec(),
        };
        evaluate(&unlocking, &locking, sighash)
    }

    /// Verify a serialized scriptSig against a serialized scriptPubKey
    pub fn verify_input(script_sig: &[u8], script_pubkey: &[u8], sighash: &Hash256) -> bool {
        match (
            UnlockingScript::parse_p2pkh(script_sig),
            LockingScript::parse(script_pubkey),
        ) {
            (Some(unlocking), Some(locking)) => evaluate(&unlocking, &locking, sighash),
            _ => false,
        }
    }
}
