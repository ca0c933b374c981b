//! Property: rollback is the inverse of any transactional mutation
//! sequence. The audit log may grow and undone inserts leave tombstoned
//! records behind, but the observable live rows are restored exactly.

use flatbase::{row, Database, Transaction};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Insert(String),
    Update(usize, String),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Op::Insert),
        (any::<usize>(), "[a-z]{1,8}").prop_map(|(t, v)| Op::Update(t, v)),
        any::<usize>().prop_map(Op::Delete),
    ]
}

fn snapshot(db: &Database) -> Vec<(String, bool)> {
    let t = db.table("T").unwrap();
    (0..t.number_of_rows().unwrap())
        .map(|n| {
            (
                t.read_cell_trimmed(n, "NAME").unwrap(),
                t.is_deleted(n).unwrap(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rollback_restores_the_pre_transaction_state(
        seed in prop::collection::vec("[a-z]{1,8}", 1..4),
        ops in prop::collection::vec(op_strategy(), 0..12),
    ) {
        let tmp = TempDir::with_prefix("undo_prop").unwrap();
        let mut db = Database::open(tmp.path()).unwrap();
        db.new_table("T").unwrap();
        db.add_column("T", "NAME", 8).unwrap();
        for name in &seed {
            db.insert_row("T", &row! { "NAME" => name }).unwrap();
        }

        let before = snapshot(&db);
        let pre_rows = before.len() as u64;

        // interpret the ops against a model of the live rows so that every
        // generated operation is valid and the transaction never aborts
        let mut live: Vec<u64> = (0..pre_rows).collect();
        let mut next_row = pre_rows;
        let mut tx = Transaction::new();
        for op in &ops {
            match op {
                Op::Insert(name) => {
                    let n = db.insert(&mut tx, "T", &row! { "NAME" => name }).unwrap();
                    prop_assert_eq!(n, next_row);
                    live.push(n);
                    next_row += 1;
                }
                Op::Update(target, value) => {
                    if live.is_empty() {
                        continue;
                    }
                    let n = live[target % live.len()];
                    db.update(&mut tx, "T", n, &row! { "NAME" => value }).unwrap();
                }
                Op::Delete(target) => {
                    if live.is_empty() {
                        continue;
                    }
                    let n = live.remove(target % live.len());
                    db.delete(&mut tx, "T", n).unwrap();
                }
            }
        }

        tx.rollback(&db).unwrap();

        let after = snapshot(&db);
        // pre-existing rows are restored cell for cell, tombstones included
        prop_assert_eq!(&after[..before.len()], &before[..]);
        // rows appended inside the transaction remain only as tombstones
        for (name, deleted) in &after[before.len()..] {
            prop_assert!(*deleted, "row `{}` should be tombstoned after rollback", name);
        }
    }
}
