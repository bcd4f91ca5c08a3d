use criterion::{black_box, criterion_group, criterion_main, Criterion};

use terratile::tilar::{CreateMode, FileIndex, OpenMode, Options, Tilar};

fn bench_archive_roundtrip(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let options = Options::new(5, 2, uuid::Uuid::from_bytes([1; 16]));
    let payload = vec![0xa5u8; 16 * 1024];

    c.bench_function("tilar_write_flush", |b| {
        let mut run = 0u32;
        b.iter(|| {
            let path = dir.path().join(format!("bench-{run}.tilar"));
            run += 1;
            let archive = Tilar::create(&path, options, CreateMode::Truncate).unwrap();
            for col in 0..8 {
                let mut sink = archive.output(FileIndex::new(col, 0, 0)).unwrap();
                sink.write(&payload);
                sink.close().unwrap();
            }
            archive.flush().unwrap();
        })
    });

    let path = dir.path().join("read.tilar");
    {
        let archive = Tilar::create(&path, options, CreateMode::Truncate).unwrap();
        for col in 0..8 {
            let mut sink = archive.output(FileIndex::new(col, 0, 0)).unwrap();
            sink.write(&payload);
            sink.close().unwrap();
        }
        archive.flush().unwrap();
    }

    c.bench_function("tilar_read_mmap", |b| {
        let archive = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        b.iter(|| {
            for col in 0..8 {
                let source = archive.input(FileIndex::new(col, 0, 0)).unwrap();
                black_box(source.bytes().len());
            }
        })
    });
}

criterion_group!(benches, bench_archive_roundtrip);
criterion_main!(benches);
