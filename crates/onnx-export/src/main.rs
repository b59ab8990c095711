use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use onnx_export::{export, ExportConfig};

/// Location of the fine-tuned checkpoint, relative to the working directory.
const DEFAULT_MODEL_DIR: &str = "models/bge-m3-finetuned";

#[derive(Parser)]
#[command(
    name = "onnx-export",
    about = "Export the embedding model's dense head to a portable ONNX artifact"
)]
struct Args {
    /// Output subdirectory, relative to the current working directory.
    output_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cwd = env::current_dir()?;
    let output_path = match args.output_dir {
        Some(dir) => cwd.join(dir),
        None => cwd.clone(),
    };

    let config = ExportConfig::new(cwd.join(DEFAULT_MODEL_DIR), output_path);
    export(&config)?;
    Ok(())
}
