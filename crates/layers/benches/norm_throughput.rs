use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{LayerNorm, NormConfig, NormGradRequest, PrecisionPolicy};

fn bench_layer_norm(c: &mut Criterion) {
    let device = Device::Cpu;
    let rows = 256usize;
    let hidden_sizes = &[1024usize, 2048, 4096];
    let dtypes = &[DType::F16, DType::BF16, DType::F32];

    for &dtype in dtypes {
        let mut group = c.benchmark_group(format!("layer_norm/{dtype:?}"));
        for &hidden in hidden_sizes {
            let input = Tensor::randn(0f32, 1.0, (rows, hidden), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let d_out = Tensor::randn(0f32, 1.0, (rows, hidden), &device)
                .expect("d_out")
                .to_dtype(dtype)
                .expect("cast d_out");
            let policy = PrecisionPolicy::from_storage(dtype);
            let weight = Tensor::ones((hidden,), dtype, &device).expect("weight");
            let bias = Tensor::zeros((hidden,), dtype, &device).expect("bias");
            let norm = LayerNorm::new(NormConfig::new(hidden), Some(weight), Some(bias)).expect("layer norm");
            let stats = norm.forward(&input, &policy).expect("stats");

            group.throughput(Throughput::Elements((rows * hidden) as u64));

            group.bench_with_input(
                BenchmarkId::new("forward", hidden),
                &(norm.clone(), input.clone()),
                |b, (norm, input)| {
                    b.iter(|| {
                        let out = norm.forward(black_box(input), &policy).expect("forward");
                        black_box(out);
                    });
                },
            );

            let request = NormGradRequest {
                scale: true,
                bias: true,
            };
            group.bench_with_input(
                BenchmarkId::new("backward", hidden),
                &(norm, input, d_out),
                |b, (norm, input, d_out)| {
                    b.iter(|| {
                        let grads = norm
                            .backward(input, black_box(d_out), &stats.mean, &stats.variance, request, &policy)
                            .expect("backward");
                        black_box(grads);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_layer_norm);
criterion_main!(benches);
