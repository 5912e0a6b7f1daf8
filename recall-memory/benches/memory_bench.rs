use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use recall_memory::search::Bm25Index;
use recall_memory::{
    MemoryConfig, MemoryCoordinator, MemoryEntry, MemoryType, RetrievalRequest, StoreContext,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;

const SIZES: [usize; 2] = [100, 500];
const TOPICS: [&str; 6] = ["deploy", "database", "auth", "billing", "cache", "search"];

fn content(i: usize) -> String {
    format!(
        "Note {i}: the {} service changed its retry policy to {} attempts",
        TOPICS[i % TOPICS.len()],
        i % 7 + 1
    )
}

fn populated(rt: &Runtime, size: usize) -> (MemoryCoordinator, TempDir) {
    let dir = TempDir::new().unwrap();
    let memory = MemoryCoordinator::new(MemoryConfig::with_data_dir(dir.path()));
    rt.block_on(async {
        memory.initialize().await.unwrap();
        for i in 0..size {
            memory
                .store(
                    &content(i),
                    MemoryType::Episodic,
                    None,
                    StoreContext::session("bench").scores([8.0, 8.0]),
                )
                .await
                .unwrap();
        }
    });
    (memory, dir)
}

fn bench_keyword_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("bm25");
    for size in SIZES {
        let entries: Vec<MemoryEntry> = (0..size)
            .map(|i| {
                MemoryEntry::builder()
                    .memory_type(MemoryType::Semantic)
                    .content(content(i))
                    .build()
                    .unwrap()
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("build", size), &entries, |b, entries| {
            b.iter(|| Bm25Index::build(entries.iter()))
        });

        let index = Bm25Index::build(entries.iter());
        group.bench_with_input(BenchmarkId::new("search", size), &index, |b, index| {
            b.iter(|| index.search("database retry policy"))
        });
    }
    group.finish();
}

fn bench_retrieve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("retrieve");
    group.sample_size(20);

    for size in SIZES {
        let (memory, _dir) = populated(&rt, size);

        group.bench_function(BenchmarkId::new("ranked", size), |b| {
            b.iter(|| {
                rt.block_on(memory.retrieve(
                    RetrievalRequest::new("database retry policy")
                        .deduplicate(true)
                        .max_tokens(400),
                ))
                .unwrap()
            })
        });

        group.bench_function(BenchmarkId::new("meta_count", size), |b| {
            b.iter(|| {
                rt.block_on(memory.retrieve(RetrievalRequest::new("how many episodic memories")))
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_keyword_index, bench_retrieve);
criterion_main!(benches);
