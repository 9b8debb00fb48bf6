//! Debug builds warn when a mask leaves a query row with no attendable key.
//!
//! Lives in its own test binary because the capturing logger is process-wide.

use std::sync::Mutex;

use attention::{build_source_mask, build_target_mask, Config, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use layers::LinearInit;
use log::{LevelFilter, Log, Metadata, Record};

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct Capture;

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            CAPTURED
                .lock()
                .expect("log buffer")
                .push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: Capture = Capture;

fn drain() -> Vec<String> {
    std::mem::take(&mut *CAPTURED.lock().expect("log buffer"))
}

#[test]
fn fully_padded_rows_are_counted_per_head_and_query() -> anyhow::Result<()> {
    log::set_logger(&LOGGER).expect("single logger per test binary");
    log::set_max_level(LevelFilter::Warn);

    let device = Device::Cpu;
    let attention = MultiHeadAttention::new(
        Config::new(6, 3),
        &LinearInit::default(),
        &device,
        DType::F32,
    )?;
    let x = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;

    // Second batch row is entirely padding: 3 heads x 5 queries lose every key.
    let src = Tensor::from_vec(vec![3i64, 4, 0, 1, 2, 0, 0, 0, 0, 0], (2, 5), &device)?;
    let mask = build_source_mask(&src, 0)?;
    attention.forward(&x, &x, &x, Some(&mask))?;
    let warnings = drain();

    if cfg!(debug_assertions) {
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(
            warnings[0].contains("15 of 30 query row(s)"),
            "{}",
            warnings[0]
        );
    } else {
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    // A causal mask always leaves the diagonal open.
    let causal = build_target_mask(2, 5, &device)?;
    attention.forward(&x, &x, &x, Some(&causal))?;
    attention.forward(&x, &x, &x, None)?;
    assert!(drain().is_empty());
    Ok(())
}
