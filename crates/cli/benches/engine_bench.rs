use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{Config, HrDb, KvDb, Rect};
use tempfile::tempdir;

const N: usize = 1_000;
const VAL_SIZE: usize = 100;

fn bench_config() -> Config {
    Config::default().max_buffer_size(256).wal_sync(false)
}

fn kv_add_with_flush(c: &mut Criterion) {
    c.bench_function("kv_add_with_flush_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = KvDb::open(dir.path(), bench_config()).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N {
                    db.add(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
                        .unwrap();
                }
                db.flush().unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn kv_get_buffer_hit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = KvDb::open(dir.path(), Config::default()).unwrap();
    for i in 0..N {
        db.add(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }

    c.bench_function("kv_get_buffer_hit_1k", |b| {
        b.iter(|| {
            for i in 0..N {
                criterion::black_box(db.get(format!("k{:06}", i).as_bytes()).unwrap());
            }
        });
    });
}

fn kv_get_segment_hit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = KvDb::open(dir.path(), bench_config()).unwrap();
    for i in 0..N * 10 {
        db.add(format!("k{:06}", i).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }
    db.compact().unwrap();

    c.bench_function("kv_get_segment_hit_1k", |b| {
        b.iter(|| {
            for i in (0..N * 10).step_by(10) {
                criterion::black_box(db.get(format!("k{:06}", i).as_bytes()).unwrap());
            }
        });
    });

    c.bench_function("kv_at_compacted_1k", |b| {
        b.iter(|| {
            for rank in (0..N as u64 * 10).step_by(10) {
                criterion::black_box(db.at(rank).unwrap());
            }
        });
    });
}

fn kv_cursor_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = KvDb::open(dir.path(), bench_config()).unwrap();
    for i in 0..N * 10 {
        db.add(format!("k{:06}", i % (N * 5)).as_bytes(), &[b'x'; VAL_SIZE])
            .unwrap();
    }

    c.bench_function("kv_cursor_scan_merged", |b| {
        b.iter(|| {
            let mut cursor = db.begin().unwrap();
            let mut n = 0usize;
            while cursor.has_next() {
                n += cursor.value().unwrap().len();
                cursor.next().unwrap();
            }
            criterion::black_box(n);
        });
    });
}

fn hr_search(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = HrDb::open(dir.path(), bench_config()).unwrap();
    for i in 0..N as u32 * 10 {
        let (x, y) = ((i * 7919) % 10_000, (i * 104_729) % 10_000);
        db.add(Rect::new(x, y, x + 20, y + 20), &i.to_le_bytes())
            .unwrap();
    }
    db.compact().unwrap();

    c.bench_function("hr_search_window_100", |b| {
        b.iter(|| {
            for i in 0..100u32 {
                let x = (i * 97) % 9_900;
                criterion::black_box(db.search(&Rect::new(x, x, x + 100, x + 100)).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    kv_add_with_flush,
    kv_get_buffer_hit,
    kv_get_segment_hit,
    kv_cursor_scan,
    hr_search,
);

criterion_main!(benches);
