//! Performance benchmarks for the docmirror store.
//!
//! - `vector_search`: exact cosine search at 100, 1000 and 5000 chunks
//! - `keyword_search`: FTS5 lookup over the same corpus
//! - `replace_document`: atomic swap of one document with 10, 50 and 200 chunks
//! - `chunking`: splitting a long markdown document
//!
//! ```bash
//! cargo bench                      # everything
//! cargo bench -- vector_search     # one group
//! ```
//!
//! Vectors come from `HashEmbedder`, so no network is involved.

use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use docmirror::config::ChunkingConfig;
use docmirror::embeddings::HashEmbedder;
use docmirror::indexer::{Chunker, ParsedDocument};
use docmirror::storage::{
    init_storage, ChunkRecord, Database, DocumentRecord, DocumentWrite, EmbeddedChunk, SearchOptions,
    VectorStore,
};

const DIMS: usize = 384;
const CHUNKS_PER_DOC: usize = 20;

const WORDS: &[&str] = &[
    "invoice", "contract", "meeting", "budget", "roadmap", "release", "customer", "quarter",
    "hiring", "security", "migration", "latency", "storage", "renewal", "audit", "forecast",
];

fn sentence(seed: usize) -> String {
    (0..12)
        .map(|i| WORDS[(seed * 7 + i * 3) % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn document_write(embedder: &HashEmbedder, path: &str, chunks: usize, seed: usize) -> DocumentWrite {
    let chunks: Vec<EmbeddedChunk> = (0..chunks)
        .map(|i| {
            let content = sentence(seed + i);
            let vector = embedder.vector(&content);
            EmbeddedChunk {
                chunk: ChunkRecord {
                    chunk_id: format!("{path}#{i}"),
                    document_path: path.to_string(),
                    start_offset: i * content.len(),
                    end_offset: (i + 1) * content.len(),
                    chunk_index: i,
                    content,
                    metadata: serde_json::json!({}),
                },
                vector,
            }
        })
        .collect();

    DocumentWrite {
        document: DocumentRecord {
            path: path.to_string(),
            content_hash: format!("{seed:016x}"),
            file_type: "txt".to_string(),
            metadata: serde_json::json!({}),
            chunk_count: chunks.len(),
            model_id: format!("hash-{DIMS}"),
            parsed_at: 0,
            updated_at: 0,
        },
        document_vector: chunks.first().map(|c| c.vector.clone()),
        chunks,
        dimensions: DIMS,
    }
}

fn populated_store(total_chunks: usize) -> VectorStore {
    let db = Database::open_in_memory().expect("failed to open database");
    init_storage(&db).expect("failed to init storage");
    let store = VectorStore::new(db, format!("hash-{DIMS}"), DIMS);
    let embedder = HashEmbedder::new(DIMS);

    for doc in 0..total_chunks.div_ceil(CHUNKS_PER_DOC) {
        let path = format!("/docs/file_{doc}.txt");
        store
            .replace_document(&document_write(&embedder, &path, CHUNKS_PER_DOC, doc))
            .expect("insert failed");
    }
    store
}

fn bench_vector_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_search");
    group.sample_size(10);
    group.measurement_time(std::time::Duration::from_secs(5));

    let embedder = HashEmbedder::new(DIMS);
    let query = embedder.vector("budget forecast for next quarter");

    for count in [100, 1000, 5000] {
        let store = populated_store(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let hits = store.search(&query, &SearchOptions::new(10)).expect("search failed");
                black_box(hits);
            });
        });
    }

    group.finish();
}

fn bench_keyword_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyword_search");
    group.sample_size(10);

    let store = populated_store(1000);
    group.bench_function("1000_chunks", |b| {
        b.iter(|| {
            let hits = store
                .keyword_search("security audit", &SearchOptions::new(10))
                .expect("keyword search failed");
            black_box(hits);
        });
    });

    group.finish();
}

fn bench_replace_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("replace_document");
    group.sample_size(10);

    let embedder = HashEmbedder::new(DIMS);
    for chunks in [10, 50, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(chunks), &chunks, |b, &chunks| {
            b.iter_batched(
                || {
                    let store = populated_store(100);
                    let write = document_write(&embedder, "/docs/file_0.txt", chunks, 99);
                    (store, write)
                },
                |(store, write)| store.replace_document(&write).expect("replace failed"),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");

    let content: String = (0..400)
        .map(|i| {
            if i % 20 == 0 {
                format!("# Section {i}\n\n")
            } else {
                format!("{}.\n\n", sentence(i))
            }
        })
        .collect();
    let document = ParsedDocument {
        path: PathBuf::from("/docs/long.md"),
        content,
        file_type: "md".to_string(),
        metadata: serde_json::json!({}),
    };
    let chunker = Chunker::new(ChunkingConfig::default());

    group.bench_function("markdown_400_paragraphs", |b| {
        b.iter(|| black_box(chunker.chunk(&document)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_vector_search,
    bench_keyword_search,
    bench_replace_document,
    bench_chunking,
);

criterion_main!(benches);
