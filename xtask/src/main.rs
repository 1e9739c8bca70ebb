use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::Command;

/// Object the userspace loader embeds with `include_bytes_aligned!`
const EBPF_OBJECT: &str = "target/bpfel-unknown-none/release/goscope";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the lifecycle probes
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
    /// Build the probes and the loader, then run the loader under sudo
    Run {
        /// Arguments passed through to goscope
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
        Cmd::Run { args } => run(&args)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Debug eBPF builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .args(["+nightly", "build", "--package", "goscope-ebpf", "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    let object = Path::new(EBPF_OBJECT);
    let size = std::fs::metadata(object)
        .with_context(|| format!("eBPF object missing after build: {}", object.display()))?
        .len();

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Object: {} ({size} bytes)", object.display());

    Ok(())
}

fn run(goscope_args: &[String]) -> Result<()> {
    build_ebpf("bpfel-unknown-none", true)?;

    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "goscope"])
        .status()
        .context("Failed to build goscope")?;
    if !status.success() {
        anyhow::bail!("Failed to build goscope");
    }

    let status = Command::new("sudo")
        .arg("-E")
        .arg("target/release/goscope")
        .args(goscope_args)
        .status()
        .context("Failed to run goscope")?;
    if !status.success() {
        anyhow::bail!("goscope exited with {status}");
    }
    Ok(())
}
