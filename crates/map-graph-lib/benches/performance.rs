//! Performance benchmarks for map-graph-lib
//!
//! Run with: cargo bench --package map-graph-lib

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use map_graph_lib::{BBox, Dataset, DatasetMerger, LatLon, Node, QuadBuckets, Result, Way};

/// Nodes on a jittered grid around a base coordinate, ids starting at `first_id`
fn generate_nodes(count: usize, first_id: i64, base_lat: f64, base_lon: f64) -> Vec<Node> {
    let side = (count as f64).sqrt().ceil() as usize;
    (0..count)
        .map(|i| {
            let (row, col) = ((i / side) as f64, (i % side) as f64);
            let lat = base_lat + row * 0.001 + (col * 0.7).sin() * 0.0001;
            let lon = base_lon + col * 0.001 + (row * 0.3).cos() * 0.0001;
            Node::with_id(first_id + i as i64, 1)
                .unwrap()
                .with_coor(LatLon::new(lat, lon))
        })
        .collect()
}

/// A dataset with `count` nodes chained into ways of 100 nodes each
fn build_dataset(count: usize) -> Dataset {
    let dataset = Dataset::new();
    dataset
        .update(|tx| -> Result<()> {
            for node in generate_nodes(count, 1, 51.5, -0.1) {
                tx.add_primitive(node)?;
            }
            let ids: Vec<i64> = (1..=count as i64).collect();
            for (i, chunk) in ids.chunks(100).enumerate() {
                let way = Way::with_id(1_000_000 + i as i64, 1)?
                    .with_nodes(chunk.iter().copied())
                    .with_tag("highway", "residential");
                tx.add_primitive(way)?;
            }
            Ok(())
        })
        .unwrap();
    dataset
}

// ============================================================================
// Core Benchmarks - Key performance indicators
// ============================================================================

fn bench_node_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion");
    group.sample_size(20);

    for count in [1_000, 10_000, 50_000] {
        let nodes = generate_nodes(count, 1, 51.5, -0.1);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("dataset", count), &nodes, |b, nodes| {
            b.iter(|| {
                let dataset = Dataset::new();
                dataset
                    .update(|tx| {
                        for node in nodes.iter().cloned() {
                            tx.add_primitive(node)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                dataset
            });
        });
    }

    let nodes = generate_nodes(50_000, 1, 51.5, -0.1);
    group.bench_function("quadtree_50k", |b| {
        b.iter(|| {
            let mut tree = QuadBuckets::new();
            for node in &nodes {
                tree.add(node.id(), node.bbox());
            }
            tree
        });
    });

    group.finish();
}

fn bench_bbox_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    let dataset = build_dataset(50_000);
    let contents = dataset.read();

    // Small viewport (detailed view)
    let small = BBox::new(-0.1, 51.5, -0.09, 51.51);
    group.bench_function("small_viewport_50k", |b| {
        b.iter(|| contents.search_nodes(&small).len());
    });

    // Large viewport (overview)
    let large = BBox::new(-2.0, 50.0, 1.0, 53.0);
    group.bench_function("large_viewport_50k", |b| {
        b.iter(|| contents.search_nodes(&large).len());
    });

    group.bench_function("ways_small_viewport_50k", |b| {
        b.iter(|| contents.search_ways(&small).len());
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    let count = 10_000;
    let source = build_dataset(count);
    group.throughput(Throughput::Elements(source.read().len() as u64));

    group.bench_function("into_empty_10k", |b| {
        b.iter(|| {
            let target = Dataset::new();
            DatasetMerger::new(&target, &source)
                .merge()
                .unwrap()
        });
    });

    // Every primitive already exists in the target with the same version
    let existing = build_dataset(count);
    group.bench_function("identical_10k", |b| {
        b.iter(|| {
            DatasetMerger::new(&existing, &source)
                .merge()
                .unwrap()
        });
    });

    group.bench_function("export_10k", |b| {
        b.iter(|| source.read().export().len());
    });

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(benches, bench_node_insertion, bench_bbox_search, bench_merge);

criterion_main!(benches);
