use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_spatial::autocorrelation::compute_autocorrelation;
use tessera_spatial::proximity::compute_proximity;
use tessera_spatial::{
    assemble_feature_matrix, BruteForceBuilder, CellAreaSum, CellGeometry, Channel, ChannelIndex,
    ExpressionRow, FeatureMatrix, IndexBuilder, KdTreeBuilder, PhenotypeSignature, Point,
    ProximityConfig,
};

const SYMBOLS: [&str; 4] = ["CD3", "CD8", "CD20", "PanCK"];

fn random_points(n: usize, seed: u64) -> Vec<Point> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..n)
        .map(|_| Point::new(next() * 2_000.0, next() * 2_000.0))
        .collect()
}

fn random_matrix(n: usize, seed: u64) -> FeatureMatrix {
    let channels = ChannelIndex::new(
        SYMBOLS
            .iter()
            .enumerate()
            .map(|(i, s)| Channel::new(i as i64 + 1, *s)),
    )
    .unwrap();
    let points = random_points(n, seed);
    let mut expression = Vec::with_capacity(n * SYMBOLS.len());
    let mut cells = Vec::with_capacity(n);
    for (i, p) in points.iter().enumerate() {
        let structure = i as i64;
        for c in 0..SYMBOLS.len() {
            expression.push(ExpressionRow {
                structure,
                channel: c as i64 + 1,
                positive: (i * 7 + c * 3) % 5 < 2,
                intensity: None,
            });
        }
        cells.push(CellGeometry {
            structure,
            centroid: *p,
            area: 80.0,
            compartment: Some(if p.x < 1_000.0 { "Tumor" } else { "Stroma" }.to_string()),
            manifest: "bench".to_string(),
        });
    }
    assemble_feature_matrix("bench", &channels, expression, cells, false).unwrap()
}

fn single_markers(matrix: &FeatureMatrix) -> Vec<PhenotypeSignature> {
    matrix
        .channels()
        .compile(&matrix.channels().single_marker_phenotypes())
        .unwrap()
}

fn bench_radius_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("within_radius");

    let points = random_points(20_000, 42);
    let queries = &points[..2_000];
    for (name, builder) in [
        ("kd_tree", &KdTreeBuilder as &dyn IndexBuilder),
        ("brute_force", &BruteForceBuilder),
    ] {
        let index = builder.build(&points);
        group.bench_function(format!("{}_20k_r50", name), |b| {
            b.iter(|| index.within_radius(black_box(queries), 50.0))
        });
    }

    group.finish();
}

fn bench_proximity(c: &mut Criterion) {
    let mut group = c.benchmark_group("proximity");
    group.sample_size(10);

    let matrix = random_matrix(20_000, 7);
    let phenotypes = single_markers(&matrix);
    let config = ProximityConfig::default();
    group.bench_function("20k_cells_4_markers", |b| {
        b.iter(|| {
            compute_proximity(
                black_box(&matrix),
                &phenotypes,
                &config,
                &KdTreeBuilder,
                &CellAreaSum,
            )
        })
    });

    group.finish();
}

fn bench_autocorrelation(c: &mut Criterion) {
    let mut group = c.benchmark_group("autocorrelation");
    group.sample_size(10);

    let matrix = random_matrix(20_000, 11);
    group.bench_function("20k_cells_r50", |b| {
        b.iter(|| compute_autocorrelation(black_box(&matrix), 50.0, &KdTreeBuilder))
    });

    group.finish();
}

criterion_group!(benches, bench_radius_query, bench_proximity, bench_autocorrelation);
criterion_main!(benches);
