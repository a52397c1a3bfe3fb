use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use simplebank_core::{Context, CreateAccountParams, Database, Store, TransferTxParams};
use simplebank_memory::InMemoryStorage;
use simplebank_sqlite::SqliteStorage;

fn setup(db: Arc<dyn Database>) -> (Store, i64, i64) {
    let store = Store::new(db);
    let ctx = Context::background();
    let open = |owner: &str| {
        store
            .create_account(
                &ctx,
                &CreateAccountParams {
                    owner: owner.to_string(),
                    balance: 1_000_000_000,
                    currency: "USD".to_string(),
                },
            )
            .unwrap()
            .id
    };
    let a = open("alice");
    let b = open("bob");
    (store, a, b)
}

fn bench_transfer(c: &mut Criterion, name: &str, db: Arc<dyn Database>) {
    let (store, a, b) = setup(db);
    let ctx = Context::background();
    let forward = TransferTxParams { from_account_id: a, to_account_id: b, amount: 1 };
    let backward = TransferTxParams { from_account_id: b, to_account_id: a, amount: 1 };

    c.bench_function(name, |bench| {
        bench.iter(|| {
            store.transfer_tx(&ctx, black_box(&forward)).unwrap();
            store.transfer_tx(&ctx, black_box(&backward)).unwrap()
        })
    });
}

fn bench_memory_transfer(c: &mut Criterion) {
    bench_transfer(c, "memory_transfer_round_trip", Arc::new(InMemoryStorage::new()));
}

fn bench_sqlite_transfer(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.db");
    let storage = SqliteStorage::new(path.to_str().unwrap()).unwrap();
    bench_transfer(c, "sqlite_transfer_round_trip", Arc::new(storage));
}

fn bench_get_account(c: &mut Criterion) {
    let (store, a, _) = setup(Arc::new(InMemoryStorage::new()));
    let ctx = Context::background();

    c.bench_function("memory_get_account", |bench| {
        bench.iter(|| store.get_account(&ctx, black_box(a)).unwrap())
    });
}

criterion_group!(benches, bench_memory_transfer, bench_sqlite_transfer, bench_get_account);
criterion_main!(benches);
