// Conflicting spends of one output

mod common;

use common::*;
use ledger_node::consensus::ValidationError;
use ledger_node::{ConflictError, NodeError, SubmitStatus, TransactionBuilder};

#[test]
fn second_spend_conflicts_until_first_confirms() {
    let chain = new_chain(regtest());
    let (alice, bob, carol) = (key(1), key(2), key(3));
    chain.request_mine(&alice.script_pubkey()).unwrap();

    let coins = chain.spendable_utxos(&alice.address);
    assert_eq!(coins.len(), 1);
    let outpoint = coins[0].0;

    let first = TransactionBuilder::new(&alice, coins.clone()).build(&bob.address, 5_000, 100).unwrap();
    let second = TransactionBuilder::new(&alice, coins).build(&carol.address, 7_000, 100).unwrap();

    assert_eq!(chain.submit_transaction(first.clone()).unwrap(), SubmitStatus::Accepted);
    assert_eq!(
        chain.submit_transaction(second.clone()).unwrap_err(),
        NodeError::Conflict(ConflictError::DoubleSpend {
            outpoint,
            spender: first.txid(),
        })
    );
    assert_eq!(chain.mempool_size(), 1);

    let (block, _) = chain.request_mine(&key(9).script_pubkey()).unwrap();
    assert_eq!(block.transactions[1].txid(), first.txid());

    assert!(chain.get_utxo(&outpoint).is_none());
    assert!(chain.is_confirmed(&first.txid()));
    assert_eq!(chain.mempool_size(), 0);
    assert_eq!(chain.get_balance(&bob.address), 5_000);

    // with the output gone the loser is simply invalid
    assert_eq!(
        chain.submit_transaction(second).unwrap_err(),
        NodeError::Validation(ValidationError::MissingInput(outpoint))
    );
    assert_eq!(chain.submit_transaction(first).unwrap(), SubmitStatus::AlreadyKnown);
}

#[test]
fn block_spending_one_output_twice_is_rejected() {
    let chain = new_chain(regtest());
    let (alice, bob, carol) = (key(1), key(2), key(3));
    chain.request_mine(&alice.script_pubkey()).unwrap();

    let coins = chain.spendable_utxos(&alice.address);
    let first = TransactionBuilder::new(&alice, coins.clone()).build(&bob.address, 5_000, 100).unwrap();
    let second = TransactionBuilder::new(&alice, coins).build(&carol.address, 7_000, 100).unwrap();

    let tip = chain.tip_block().unwrap();
    let block = mine_on(&chain, tip.hash(), vec![first, second], tip.header.timestamp + 60, &alice);

    assert!(matches!(chain.process_block(block), Err(NodeError::Validation(_))));
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.get_balance(&alice.address), chain.params().initial_subsidy);
}
