use std::sync::Arc;
use std::time::Duration;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use tempfile::TempDir;

use segdex::{
    Directory, DirectoryReader, Document, FsDirectory, IndexWriter, MergePolicyConfig,
    MergeSchedulerConfig, RamDirectory, Term, WriterConfig,
};

fn create_test_doc(id: u64) -> Document {
    Document::new()
        .with_keyword("id", id.to_string())
        .with_text("body", format!("benchmark document {} about segments and merges", id))
        .with_long("timestamp", id as i64)
}

fn ram_writer(config: WriterConfig) -> IndexWriter {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
    IndexWriter::open(dir, config).unwrap()
}

// Benchmark: single-threaded add throughput at several RAM buffer sizes
fn bench_add_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_documents");
    group.measurement_time(Duration::from_secs(10));

    for &ram_mb in [1.0f64, 16.0].iter() {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(ram_mb), &ram_mb, |b, &ram_mb| {
            b.iter_batched(
                || ram_writer(WriterConfig::new().with_ram_buffer_size_mb(Some(ram_mb))),
                |writer| {
                    for id in 0..1_000 {
                        writer.add_document(create_test_doc(id)).unwrap();
                    }
                    writer.commit().unwrap();
                    black_box(writer.num_docs());
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

// Benchmark: concurrent indexing threads sharing one writer
fn bench_concurrent_adds(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_adds");
    group.sample_size(10);

    for &threads in [1usize, 4].iter() {
        group.throughput(Throughput::Elements((threads * 500) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter_batched(
                || Arc::new(ram_writer(WriterConfig::new().with_ram_buffer_size_mb(Some(1.0)))),
                |writer| {
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let writer = writer.clone();
                            std::thread::spawn(move || {
                                for i in 0..500u64 {
                                    writer.add_document(create_test_doc(t as u64 * 500 + i)).unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    writer.commit().unwrap();
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

// Benchmark: updates by id term, the delete queue's hot path
fn bench_updates(c: &mut Criterion) {
    c.bench_function("update_document", |b| {
        let writer = ram_writer(WriterConfig::new().with_max_buffered_delete_terms(Some(1_000)));
        for id in 0..1_000 {
            writer.add_document(create_test_doc(id)).unwrap();
        }
        let mut id = 0u64;
        b.iter(|| {
            writer
                .update_document(Term::new("id", (id % 1_000).to_string()), create_test_doc(id))
                .unwrap();
            id += 1;
        });
    });
}

// Benchmark: force merge plus commit on the filesystem
fn bench_force_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("force_merge");
    group.sample_size(10);
    group.bench_function("to_one_segment", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().unwrap();
                let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(tmp.path()).unwrap());
                let config = WriterConfig::new()
                    .with_max_buffered_docs(Some(100))
                    .with_ram_buffer_size_mb(None)
                    .with_merge_policy(MergePolicyConfig::NoMerge)
                    .with_merge_scheduler(MergeSchedulerConfig::Serial);
                let writer = IndexWriter::open(dir, config).unwrap();
                for id in 0..1_000 {
                    writer.add_document(create_test_doc(id)).unwrap();
                }
                writer.commit().unwrap();
                (writer, tmp)
            },
            |(writer, _tmp)| {
                writer.force_merge(1).unwrap();
                writer.commit().unwrap();
                black_box(writer.segment_count());
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

// Benchmark: near-real-time reopen after a small batch
fn bench_nrt_reopen(c: &mut Criterion) {
    c.bench_function("nrt_reopen", |b| {
        let writer = ram_writer(WriterConfig::new());
        for id in 0..1_000 {
            writer.add_document(create_test_doc(id)).unwrap();
        }
        let mut reader = DirectoryReader::open_from_writer(&writer, true).unwrap();
        let mut id = 1_000u64;
        b.iter(|| {
            writer.add_document(create_test_doc(id)).unwrap();
            id += 1;
            if let Some(next) = DirectoryReader::open_if_changed(&reader).unwrap() {
                reader.close().unwrap();
                reader = next;
            }
            black_box(reader.num_docs());
        });
    });
}

criterion_group!(
    benches,
    bench_add_documents,
    bench_concurrent_adds,
    bench_updates,
    bench_force_merge,
    bench_nrt_reopen
);
criterion_main!(benches);
