mod common;

use std::sync::Arc;

use common::{address, additions, hash, op, transfer, HUB_SPILLAGE, MODEXP};
use zk_tracer::{
    AdmissionVerdict, MempoolDecision, MempoolValidator, ModuleLimits, Transaction, WorldState,
};

fn pool() -> Vec<Transaction> {
    let mut txs: Vec<_> = (1..=20).map(|id| transfer(id, 1, usize::from(id))).collect();
    txs.push(
        Transaction::new(hash(0xaa), address(0xaa), None).with_events([op(0, MODEXP, &[4096])]),
    );
    txs
}

#[test]
fn isolated_validation_only_rejects_what_can_never_fit() {
    let validator = MempoolValidator::new(Arc::new(common::limits(12)), common::producers);

    let results = validator.validate_all(&pool());

    assert_eq!(results.len(), 21);
    for (i, (tx_hash, decision)) in results.iter().enumerate() {
        let decision = decision.as_ref().unwrap();
        match i + 1 {
            id @ 1..=12 => {
                assert_eq!(*tx_hash, hash(id as u8));
                assert!(decision.is_accept());
            }
            13..=20 => assert!(matches!(
                decision,
                MempoolDecision::Reject(AdmissionVerdict::TxRowOverflow { module, .. })
                    if module.as_str() == "hub"
            )),
            _ => assert!(matches!(
                decision,
                MempoolDecision::Reject(AdmissionVerdict::TxRowOverflow { module, .. })
                    if module.as_str() == "modexp"
            )),
        }
    }
}

#[test]
fn parallel_validation_agrees_with_sequential() {
    let mut world = WorldState::new();
    world.set_balance(address(3), 10.into());
    let validator =
        MempoolValidator::new(Arc::new(common::limits(8)), common::producers).with_world(world);
    let pool = pool();

    let parallel = validator.validate_all(&pool);
    for (tx, (tx_hash, decision)) in pool.iter().zip(parallel) {
        assert_eq!(tx_hash, tx.hash);
        assert_eq!(decision.unwrap(), validator.validate(tx).unwrap());
    }
}

#[test]
fn undefined_module_rejects_instead_of_failing() {
    let validator = MempoolValidator::new(Arc::new(Default::default()), common::producers);

    let decision = validator.validate(&transfer(1, 1, 1)).unwrap();

    assert_eq!(
        decision,
        MempoolDecision::Reject(AdmissionVerdict::ModuleNotDefined {
            module: "add".into()
        })
    );
}

#[test]
fn spillage_counts_against_an_isolated_transaction() {
    let limits: ModuleLimits = [("hub", 10)].into_iter().collect();
    let validator = MempoolValidator::new(Arc::new(limits), common::spilled_producers);

    // 8 lines fit the limit on their own, not once the spillage is added.
    assert_eq!(
        validator.validate(&additions(1, 8)).unwrap(),
        MempoolDecision::Reject(AdmissionVerdict::TxRowOverflow {
            module: "hub".into(),
            tx_lines: 8 + HUB_SPILLAGE as i64,
            limit: 10,
            cumulative: 8 + HUB_SPILLAGE as i64,
        })
    );
    assert_eq!(
        validator.validate(&additions(2, 10 - HUB_SPILLAGE)).unwrap(),
        MempoolDecision::Accept
    );
}
