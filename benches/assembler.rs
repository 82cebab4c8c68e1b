use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use zimwriter::format::cluster::Compression;
use zimwriter::writer::{Article, ClusterAssembler, IterSource, ZimCreator};

fn blobs() -> Vec<Vec<u8>> {
    (0..2000u32)
        .map(|i| {
            format!("<html><body><h1>Page {i}</h1><p>{}</p></body></html>", "lorem ipsum ".repeat(40))
                .into_bytes()
        })
        .collect()
}

fn bench_assemble(c: &mut Criterion) {
    let blobs = blobs();
    let total: usize = blobs.iter().map(Vec::len).sum();

    let mut group = c.benchmark_group("assemble_clusters");
    group.throughput(Throughput::Bytes(total as u64));
    for compression in [Compression::None, Compression::Zlib] {
        group.bench_with_input(
            BenchmarkId::new("inline", format!("{compression:?}")),
            &compression,
            |b, &compression| {
                b.iter(|| {
                    let mut assembler = ClusterAssembler::new(Vec::new(), 64 * 1024, compression);
                    for blob in &blobs {
                        assembler.add_blob(blob).unwrap();
                        assembler.maybe_flush().unwrap();
                    }
                    assembler.finish().unwrap().bytes_written
                })
            },
        );
    }
    group.bench_function("background/Zlib", |b| {
        b.iter(|| {
            let mut assembler =
                ClusterAssembler::with_background(Vec::new(), 64 * 1024, Compression::Zlib, 4);
            for blob in &blobs {
                assembler.add_blob(blob).unwrap();
                assembler.maybe_flush().unwrap();
            }
            assembler.finish().unwrap().bytes_written
        })
    });
    group.finish();
}

fn bench_create(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.zim");
    let blobs = blobs();

    c.bench_function("create_archive_2000", |b| {
        b.iter(|| {
            let articles: Vec<Article> = blobs
                .iter()
                .enumerate()
                .map(|(i, data)| {
                    Article::new(format!("page{i}"), format!("Page {i}"), "text/html", data.clone())
                })
                .collect();
            let mut creator = ZimCreator::new();
            creator.set_min_chunk_size(256 * 1024).unwrap();
            creator.create(&path, IterSource::new(articles)).unwrap();
            creator.current_size().unwrap()
        })
    });
}

criterion_group!(benches, bench_assemble, bench_create);
criterion_main!(benches);
