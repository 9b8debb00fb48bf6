use attention::{build_target_mask, Config, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::LinearInit;

fn bench_self_attention(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 2usize;
    let shapes = &[(256usize, 8usize), (512, 8), (512, 16)];
    let seq_lengths = &[16usize, 64, 128];
    let dtypes = &[DType::F32, DType::F16];

    for &dtype in dtypes {
        let mut group = c.benchmark_group(format!("mha/{dtype:?}"));
        for &(embed, heads) in shapes {
            let attention = MultiHeadAttention::new(
                Config::new(embed, heads),
                &LinearInit::XavierUniform,
                &device,
                dtype,
            )
            .expect("attention init");
            for &seq in seq_lengths {
                let input = Tensor::randn(0f32, 1.0, (batch, seq, embed), &device)
                    .expect("input")
                    .to_dtype(dtype)
                    .expect("cast input");
                let mask = build_target_mask(batch, seq, &device).expect("mask");
                let elements = (batch * heads * seq * seq * (embed / heads)) as u64;
                group.throughput(Throughput::Elements(elements));
                group.bench_with_input(
                    BenchmarkId::from_parameter(format!("e{embed}h{heads}s{seq}")),
                    &(input, mask),
                    |b, (input, mask)| {
                        b.iter(|| {
                            let out = attention
                                .forward(black_box(input), input, input, Some(mask))
                                .expect("forward");
                            black_box(out);
                        });
                    },
                );
            }
        }
        group.finish();
    }
}

criterion_group!(benches, bench_self_attention);
criterion_main!(benches);
