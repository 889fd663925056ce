// Shared helpers for scenario tests
#![allow(dead_code)]

use ledger_node::core::Script;
use ledger_node::{
    Block, ChainManager, ChainParams, Hash256, KeyPair, Miner, OutPoint, Transaction, TxInput, TxOutput, Utxo,
};

/// Deterministic key from a one-byte seed
pub fn key(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
}

/// Trivial work, immediately spendable rewards and no retargeting during a test
pub fn regtest() -> ChainParams {
    ChainParams {
        retarget_interval: 1000,
        ..ChainParams::regtest()
    }
}

/// Retarget every second block so short branches end up with different work
pub fn fork_params() -> ChainParams {
    ChainParams {
        retarget_interval: 2,
        ..ChainParams::regtest()
    }
}

pub fn new_chain(params: ChainParams) -> ChainManager {
    ChainManager::new(params, None).unwrap()
}

pub fn genesis_time(chain: &ChainManager) -> u32 {
    chain.get_block(0).unwrap().header.timestamp
}

/// Mine a block on `parent` with the given transactions and timestamp
pub fn mine_on(chain: &ChainManager, parent: Hash256, txs: Vec<Transaction>, timestamp: u32, miner: &KeyPair) -> Block {
    let template = chain
        .template_on(&parent, txs, timestamp, &miner.script_pubkey())
        .unwrap();
    let mut block = template.block;
    let result = Miner::new(block.header.bits).unwrap().mine(&mut block.header, || false);
    assert!(result.success());
    block
}

/// Mine and process a chain of empty blocks on `parent`, one per timestamp
pub fn mine_branch(chain: &ChainManager, parent: Hash256, timestamps: &[u32], miner: &KeyPair) -> Vec<Block> {
    let mut parent = parent;
    let mut blocks = Vec::new();
    for &timestamp in timestamps {
        let block = mine_on(chain, parent, vec![], timestamp, miner);
        chain.process_block(block.clone()).unwrap();
        parent = block.hash();
        blocks.push(block);
    }
    blocks
}

/// Spend `coins`, all owned by `owner`, into `outputs`
pub fn signed_spend(owner: &KeyPair, coins: &[(OutPoint, Utxo)], outputs: Vec<TxOutput>) -> Transaction {
    let inputs = coins
        .iter()
        .map(|(outpoint, _)| TxInput::new(outpoint.txid, outpoint.vout, vec![]))
        .collect();
    let mut tx = Transaction::new(inputs, outputs);

    let script_sigs: Vec<Vec<u8>> = coins
        .iter()
        .enumerate()
        .map(|(index, (_, utxo))| {
            let digest = tx.sig_hash(index, &utxo.output.script_pubkey).unwrap();
            Script::p2pkh_script_sig(&owner.sign(&digest), &owner.public_key_bytes())
        })
        .collect();
    for (input, script_sig) in tx.inputs.iter_mut().zip(script_sigs) {
        input.script_sig = script_sig;
    }
    tx
}
