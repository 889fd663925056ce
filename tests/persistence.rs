// Reloading the stored chain after a reorganization

mod common;

use common::*;
use ledger_node::{ChainManager, ChainStore, SledStore};
use std::path::PathBuf;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ledger-node-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn reload_follows_reorganized_chain() {
    let dir = temp_dir("reorg-reload");
    let t;
    let tip = {
        let chain = ChainManager::new(regtest(), Some(Box::new(SledStore::open(&dir).unwrap()))).unwrap();
        let genesis = chain.tip();
        t = genesis_time(&chain);

        mine_branch(&chain, genesis, &[t + 60, t + 120], &key(1));
        let b = mine_branch(&chain, genesis, &[t + 61, t + 121, t + 181], &key(2));
        assert_eq!(chain.tip(), b[2].hash());
        chain.tip()
    };

    let store = SledStore::open(&dir).unwrap();
    let stored = store.load().unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[3].hash(), tip);

    let chain = ChainManager::new(regtest(), Some(Box::new(store))).unwrap();
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.tip(), tip);
    assert_eq!(chain.get_balance(&key(1).address), 0);
    assert_eq!(chain.get_balance(&key(2).address), 3 * regtest().initial_subsidy);

    // the reloaded chain keeps extending
    let next = mine_on(&chain, tip, vec![], t + 241, &key(1));
    assert!(chain.process_block(next).unwrap().is_new_tip());
    assert_eq!(chain.height(), 4);

    drop(chain);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn empty_store_starts_at_genesis() {
    let chain = ChainManager::new(regtest(), Some(Box::new(SledStore::memory().unwrap()))).unwrap();
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.tip(), chain.genesis_hash());
}
