//! Command-line front-end: compiles a JSON configuration into a Rust
//! source file.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use tplc::Configuration;

#[derive(Parser)]
#[command(name = "tplc")]
#[command(version)]
#[command(about = "Ahead-of-time template compiler")]
struct Cli {
    /// Path to the JSON compilation configuration.
    config: PathBuf,

    /// Override the registry variable name declared in the configuration.
    #[arg(long)]
    var: Option<String>,

    /// Working directory for glob resolution and relative output paths.
    #[arg(long)]
    wdir: Option<PathBuf>,

    /// Print the emitted source to stdout as well.
    #[arg(long)]
    print: bool,

    /// Keep a backup (`<out>.bak`) of a previously existing output file.
    #[arg(long)]
    keep: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let json = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading configuration {}", cli.config.display()))?;
    let mut cfg: Configuration = Configuration::from_json(&json)
        .with_context(|| format!("parsing configuration {}", cli.config.display()))?;

    if let Some(var) = cli.var {
        cfg.registry_variable = var;
    }
    if let Some(wdir) = &cli.wdir {
        std::env::set_current_dir(wdir)
            .with_context(|| format!("entering working directory {}", wdir.display()))?;
    }

    let source = tplc::compile(&cfg).context("compilation failed")?;

    if cli.print {
        print!("{source}");
    }
    if cli.keep && cfg.out_path.exists() {
        let backup = cfg.out_path.with_extension("rs.bak");
        fs::copy(&cfg.out_path, &backup)
            .with_context(|| format!("backing up {}", cfg.out_path.display()))?;
    }
    fs::write(&cfg.out_path, source)
        .with_context(|| format!("writing {}", cfg.out_path.display()))?;
    Ok(())
}
