//! Criterion benchmarks for dql-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init and reopening an existing catalog.
//! 2. **rows**: Dataset row insertion at various batch sizes.
//! 3. **shadow**: Building a shadow dataset from a crawled local directory.
//! 4. **promotion**: Registering a shadow as a new dataset version.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/dql-core/Cargo.toml
//! # Run only the promotion group:
//! cargo bench --manifest-path crates/dql-core/Cargo.toml -- promotion
//! ```

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rusqlite::Connection;
use serde_json::json;

use dql_core::config::CatalogConfig;
use dql_core::indexer::client::ClientRegistry;
use dql_core::models::{ColumnTypes, DatasetRow};
use dql_core::store::database::{dataset_table_name, Database};
use dql_core::store::schema::init_schema;
use dql_core::Catalog;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn setup_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    init_schema(&conn).unwrap();
    conn
}

fn synthetic_rows(n: usize) -> Vec<DatasetRow> {
    (0..n)
        .map(|i| {
            let mut row = DatasetRow {
                source: "file:///bench".to_string(),
                parent: format!("dir{}", i % 16),
                name: format!("file{i}.bin"),
                size: (i * 31 % 4096) as i64,
                checksum: format!("{i:08x}"),
                ..Default::default()
            };
            row.custom.insert("label".to_string(), json!(i % 7));
            row
        })
        .collect()
}

/// A catalog over a scratch directory holding `n` small files.
fn catalog_with_files(n: usize) -> (tempfile::TempDir, Catalog, String) {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    for i in 0..n {
        let sub = data.join(format!("d{}", i % 8));
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join(format!("f{i}.txt")), format!("payload {i}")).unwrap();
    }
    let db = Database::open(dir.path().join("db")).unwrap();
    let catalog = Catalog::new(db, CatalogConfig::default(), ClientRegistry::new());
    let source = data.to_string_lossy().to_string();
    (dir, catalog, source)
}

// ---------------------------------------------------------------------------
// Benchmark: Schema initialization
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init", |b| {
        b.iter(|| black_box(setup_db()));
    });
}

fn bench_schema_reopen(c: &mut Criterion) {
    c.bench_function("schema_reopen_existing", |b| {
        let conn = setup_db();
        b.iter(|| {
            init_schema(black_box(&conn)).unwrap();
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Row insertion
// ---------------------------------------------------------------------------

fn bench_row_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("rows");
    for size in &[100usize, 1_000, 10_000] {
        let rows = synthetic_rows(*size);
        group.bench_with_input(BenchmarkId::new("insert", size), &rows, |b, rows| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    let db = Database::open(dir.path().join("db")).unwrap();
                    (dir, db)
                },
                |(_dir, db)| {
                    db.transaction(|s| {
                        let table = dataset_table_name(1, None);
                        s.create_dataset_rows_table(&table, &ColumnTypes::new())?;
                        s.insert_dataset_rows(&table, rows)
                    })
                    .unwrap()
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Shadow build and promotion
// ---------------------------------------------------------------------------

fn bench_shadow_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("shadow");
    group.sample_size(20);
    for size in &[100usize, 1_000] {
        group.bench_with_input(BenchmarkId::new("create_from_local", size), size, |b, &size| {
            b.iter_batched(
                || catalog_with_files(size),
                |(_dir, catalog, source)| {
                    catalog
                        .create_shadow_dataset("bench", &[source], "", true, true)
                        .unwrap()
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

fn bench_promotion(c: &mut Criterion) {
    let mut group = c.benchmark_group("promotion");
    group.sample_size(20);
    for size in &[100usize, 1_000] {
        group.bench_with_input(BenchmarkId::new("register_next_version", size), size, |b, &size| {
            b.iter_batched(
                || {
                    let (dir, catalog, source) = catalog_with_files(size);
                    catalog
                        .create_shadow_dataset("base", &[source.clone()], "", true, true)
                        .unwrap();
                    catalog
                        .register_shadow_dataset("base", None, None, None, None, true)
                        .unwrap();
                    catalog
                        .create_shadow_dataset("work", &[source], "", true, true)
                        .unwrap();
                    (dir, catalog)
                },
                |(_dir, catalog)| {
                    catalog
                        .register_shadow_dataset("work", Some("base"), None, None, None, true)
                        .unwrap()
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_schema_init,
    bench_schema_reopen,
    bench_row_insertion,
    bench_shadow_build,
    bench_promotion,
);
criterion_main!(benches);
