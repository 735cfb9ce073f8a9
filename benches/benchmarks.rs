use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evolved_transformer::model::builder::load_encoder_cell;
use evolved_transformer::model::{DeviceSpec, EvolvedConfig};
use evolved_transformer::EvolvedTransformer;
use std::hint::black_box;
use std::time::Duration;

fn bench_config() -> EvolvedConfig {
    EvolvedConfig {
        vocab_size: 8000,
        hidden_dim: 128,
        pff_dim: 512,
        num_heads: 4,
        num_cells: 3,
        dropout_ratio: 0.1,
        pad_id: 0,
        device: DeviceSpec::Cpu,
        max_len: 256,
        layer_norm_eps: 1e-5,
    }
}

fn encoder_cell_benchmarks(c: &mut Criterion) {
    let config = bench_config();
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let cell = load_encoder_cell(vb, &config).expect("encoder cell");

    let mut group = c.benchmark_group("encoder_cell_forward");
    for seq_len in [16usize, 64, 128] {
        let xs = Tensor::randn(0f32, 1., (4, seq_len, config.hidden_dim), &device)
            .expect("input");
        group.throughput(Throughput::Elements((4 * seq_len) as u64));
        group.bench_with_input(BenchmarkId::new("eval", seq_len), &xs, |b, xs| {
            b.iter(|| cell.forward(black_box(xs), None).unwrap());
        });
    }
    group.finish();
}

fn model_benchmarks(c: &mut Criterion) {
    let config = bench_config();
    let (model, _varmap) = EvolvedTransformer::new_random(&config).expect("model");
    let device = model.device().clone();

    let (batch, seq_len) = (4usize, 64usize);
    let ids: Vec<u32> = (0..batch * seq_len)
        .map(|i| 1 + (i as u32 * 7919) % (config.vocab_size as u32 - 1))
        .collect();
    let src = Tensor::from_vec(ids.clone(), (batch, seq_len), &device).expect("src");
    let tgt = Tensor::from_vec(ids.clone(), (batch, seq_len), &device).expect("tgt");
    let labels = Tensor::from_vec(ids, (batch, seq_len), &device).expect("labels");

    let mut group = c.benchmark_group("model_forward");
    group.throughput(Throughput::Elements((batch * seq_len) as u64));
    group.bench_function("encode_decode_loss", |b| {
        b.iter(|| {
            let out = model
                .forward(black_box(&src), black_box(&tgt), black_box(&labels))
                .unwrap();
            black_box(out.loss);
        });
    });
    group.finish();
}

fn custom_criterion() -> Criterion {
    Criterion::default()
        .configure_from_args()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(5))
        .sample_size(10)
}

criterion_group! {
    name = benches;
    config = custom_criterion();
    targets = encoder_cell_benchmarks, model_benchmarks
}
criterion_main!(benches);
