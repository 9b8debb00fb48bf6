use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor, D};
use clap::Parser;
use model::{Transformer, TransformerConfig};

const DEFAULT_SRC: [&str; 2] = ["1,5,6,4,3,9,5,2,0", "1,8,7,3,4,5,6,7,2"];
const DEFAULT_TRG: [&str; 2] = ["1,7,4,3,5,9,2", "1,5,6,2,4,7,6"];

/// Run one forward pass of a freshly initialised seq2seq transformer and
/// report the logits shape and the greedy token at each target position.
#[derive(Parser, Debug)]
#[command(name = "seq2seq")]
struct Cli {
    /// TOML or JSON model configuration; defaults to vocab 10/10 with pad id 0
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated source token ids; repeat once per batch row
    #[arg(long = "src", value_name = "IDS")]
    src: Vec<String>,

    /// Comma-separated target token ids; repeat once per batch row
    #[arg(long = "trg", value_name = "IDS")]
    trg: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => TransformerConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TransformerConfig::new(10, 10, 0, 0),
    };
    let device = Device::Cpu;
    let config = config.with_device(device.clone());

    let src = token_batch("src", &args.src, &DEFAULT_SRC, &device)?;
    let trg = token_batch("trg", &args.trg, &DEFAULT_TRG, &device)?;

    let model = Transformer::new(config).context("building transformer")?;
    model.set_training(false);
    log::info!(
        "running forward pass src={:?} trg={:?}",
        src.dims(),
        trg.dims()
    );

    let logits = model.forward(&src, &trg).context("forward pass")?;
    println!("logits shape: {:?}", logits.dims());

    let greedy = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
    for (row, tokens) in greedy.iter().enumerate() {
        println!("batch {row}: argmax per position {tokens:?}");
    }
    Ok(())
}

/// Parses repeated `--src`/`--trg` rows into an `[batch, len]` i64 tensor.
fn token_batch(label: &str, rows: &[String], defaults: &[&str], device: &Device) -> Result<Tensor> {
    let parsed = if rows.is_empty() {
        defaults
            .iter()
            .map(|row| parse_row(label, row))
            .collect::<Result<Vec<_>>>()?
    } else {
        rows.iter()
            .map(|row| parse_row(label, row))
            .collect::<Result<Vec<_>>>()?
    };

    let width = parsed.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = parsed.iter().position(|row| row.len() != width) {
        bail!(
            "--{label} rows must share a length: row 0 has {width} tokens, row {bad} has {}",
            parsed[bad].len()
        );
    }
    let batch = parsed.len();
    let flat: Vec<i64> = parsed.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (batch, width), device)?)
}

fn parse_row(label: &str, row: &str) -> Result<Vec<i64>> {
    let tokens = row
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|err| anyhow!("--{label}: invalid token id {token:?}: {err}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if tokens.is_empty() {
        bail!("--{label}: empty token row");
    }
    Ok(tokens)
}
