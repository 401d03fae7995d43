use criterion::{black_box, criterion_group, criterion_main, Criterion};
use seqtag_core::{CrfLayer, EvalConfig, TagVocabulary, score_corpus};

const LABELS: [&str; 9] = [
    "O", "B-PER", "I-PER", "B-LOC", "I-LOC", "B-ORG", "I-ORG", "B-MISC", "I-MISC",
];

/// Deterministic pseudo-random scores so runs are comparable.
fn emissions(seq_len: usize, num_tags: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut state = seed;
    (0..seq_len)
        .map(|_| {
            (0..num_tags)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    ((state >> 33) % 1000) as f64 / 250.0 - 2.0
                })
                .collect()
        })
        .collect()
}

fn bench_crf(c: &mut Criterion) {
    let num_tags = LABELS.len() + 1;
    let mut layer = CrfLayer::zeros(num_tags).unwrap().with_pad(0).unwrap();
    for (i, row) in layer.params_mut().transitions.iter_mut().enumerate() {
        for (j, score) in row.iter_mut().enumerate() {
            *score = ((i * 7 + j * 3) % 5) as f64 * 0.1;
        }
    }
    let sentence = emissions(40, num_tags, 42);
    let gold: Vec<usize> = (0..40).map(|t| 1 + t % LABELS.len()).collect();

    c.bench_function("viterbi_40x10", |b| {
        b.iter(|| layer.decode(black_box(&sentence)).unwrap());
    });

    c.bench_function("crf_loss_40x10", |b| {
        b.iter(|| layer.loss(black_box(&sentence), black_box(&gold)).unwrap());
    });

    c.bench_function("crf_gradients_40x10", |b| {
        b.iter(|| layer.loss_and_gradients(black_box(&sentence), black_box(&gold)).unwrap());
    });
}

fn bench_scoring(c: &mut Criterion) {
    let vocab = TagVocabulary::from_sequences([LABELS], Some("<pad>"));
    let layer = CrfLayer::zeros(vocab.len()).unwrap().with_pad(0).unwrap();
    let gold: Vec<Vec<usize>> = (0..500)
        .map(|s| layer.decode(&emissions(30, vocab.len(), s)).unwrap().tags)
        .collect();
    let predicted: Vec<Vec<usize>> = (0..500)
        .map(|s| layer.decode(&emissions(30, vocab.len(), s + 1000)).unwrap().tags)
        .collect();

    c.bench_function("score_corpus_500", |b| {
        b.iter(|| score_corpus(black_box(&gold), black_box(&predicted), &vocab, &EvalConfig::lenient()).unwrap());
    });

    let parallel = EvalConfig::lenient().with_parallel(true);
    c.bench_function("score_corpus_500_parallel", |b| {
        b.iter(|| score_corpus(black_box(&gold), black_box(&predicted), &vocab, &parallel).unwrap());
    });
}

criterion_group!(benches, bench_crf, bench_scoring);
criterion_main!(benches);
