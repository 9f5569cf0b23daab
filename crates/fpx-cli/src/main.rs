#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail, ensure};
use fpx_backing::{BackingOpener, FsOpener};
use fpx_engine::{Bio, BioCompletion, BioStatus, Device, DeviceConfig, UnattachedSlowPath};
use fpx_types::{BioFlags, DeviceMode, LOGICAL_BLOCK_SIZE};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::prelude::*;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ProbeOutput<'a> {
    path: &'a str,
    kind: &'static str,
    mode: String,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "config" => {
            let config = match args.next() {
                Some(path) => load_config(Path::new(&path))?,
                None => DeviceConfig::default(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("serialize config")?
            );
            Ok(())
        }
        "probe" => {
            let Some(path) = args.next() else {
                bail!("probe requires a backing path");
            };
            let json = args.any(|arg| arg == "--json");
            probe(&path, json)
        }
        "exercise" => {
            let options = ExerciseOptions::parse(args)?;
            exercise(&options)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("fpx-cli\n");
    println!("USAGE:");
    println!("  fpx-cli config [<config.json>]");
    println!("  fpx-cli probe <backing-path> [--json]");
    println!(
        "  fpx-cli exercise [--config <config.json>] [--requests <n>] [--fua-every <n>] [--json] <backing-path>..."
    );
}

fn load_config(path: &Path) -> Result<DeviceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: DeviceConfig = serde_json::from_str(&text)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn probe(path: &str, json: bool) -> Result<()> {
    let target = FsOpener
        .open(path, DeviceMode::READ_ONLY)
        .with_context(|| format!("failed to open {path}"))?;
    let output = ProbeOutput {
        path,
        kind: target.kind().as_str(),
        mode: DeviceMode::READ_ONLY.to_string(),
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("path: {}", output.path);
        println!("kind: {}", output.kind);
    }
    Ok(())
}

// ── exercise ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ExerciseOptions {
    config: DeviceConfig,
    requests: u64,
    fua_every: u64,
    json: bool,
}

impl ExerciseOptions {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut config = None;
        let mut requests = 256;
        let mut fua_every = 0;
        let mut json = false;
        let mut paths = Vec::new();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let Some(path) = args.next() else {
                        bail!("--config requires a path");
                    };
                    config = Some(load_config(Path::new(&path))?);
                }
                "--requests" => requests = parse_count(args.next(), "--requests")?,
                "--fua-every" => fua_every = parse_count(args.next(), "--fua-every")?,
                "--json" => json = true,
                flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
                _ => paths.push(arg),
            }
        }
        let mut config = config.unwrap_or_default();
        if !paths.is_empty() {
            config.paths = paths;
        }
        ensure!(
            !config.paths.is_empty(),
            "exercise requires at least one backing path"
        );
        Ok(Self {
            config,
            requests,
            fua_every,
            json,
        })
    }
}

fn parse_count(value: Option<String>, flag: &str) -> Result<u64> {
    let Some(value) = value else {
        bail!("{flag} requires a number");
    };
    value
        .parse()
        .with_context(|| format!("{flag}: invalid number {value:?}"))
}

/// Write a pattern through the device, flush, read it back, and report the
/// device counters.
fn exercise(options: &ExerciseOptions) -> Result<()> {
    let device = Device::new(
        options.config.clone(),
        Arc::new(FsOpener),
        Arc::new(UnattachedSlowPath),
    )
    .context("failed to create device")?;
    ensure!(
        device.fastpath_enabled(),
        "fast path could not be enabled on {:?}",
        options.config.paths
    );

    let block = u64::from(LOGICAL_BLOCK_SIZE);
    let started = Instant::now();
    let (tx, rx) = mpsc::channel::<(u64, BioCompletion)>();
    for n in 0..options.requests {
        let flags = if options.fua_every > 0 && (n + 1) % options.fua_every == 0 {
            BioFlags::FUA
        } else {
            BioFlags::NONE
        };
        let tx = tx.clone();
        device.submit(Bio::write(
            n * block,
            vec![pattern(n)],
            flags,
            move |c| {
                let _ = tx.send((n, c));
            },
        ));
    }
    let mut failed = 0_u64;
    for _ in 0..options.requests {
        let (_, done) = rx
            .recv_timeout(COMPLETION_TIMEOUT)
            .context("write did not complete")?;
        if done.status != BioStatus::Ok {
            failed += 1;
        }
    }
    ensure!(failed == 0, "{failed} writes failed");

    let (flush_tx, flush_rx) = mpsc::channel();
    device.submit(Bio::flush(move |c| {
        let _ = flush_tx.send(c.status);
    }));
    let status = flush_rx
        .recv_timeout(COMPLETION_TIMEOUT)
        .context("flush did not complete")?;
    ensure!(status == BioStatus::Ok, "flush failed: {status}");

    for n in 0..options.requests {
        let tx = tx.clone();
        let len = [LOGICAL_BLOCK_SIZE as usize];
        device.submit(Bio::read(n * block, &len, move |c| {
            let _ = tx.send((n, c));
        }));
    }
    let mut mismatched = 0_u64;
    for _ in 0..options.requests {
        let (n, done) = rx
            .recv_timeout(COMPLETION_TIMEOUT)
            .context("read did not complete")?;
        if done.status != BioStatus::Ok || done.segments.first() != Some(&pattern(n)) {
            mismatched += 1;
        }
    }
    ensure!(mismatched == 0, "{mismatched} blocks read back wrong");

    let elapsed = started.elapsed();
    info!(
        target: "fpx::engine",
        requests = options.requests,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "exercise_done"
    );

    let stats = device.stats();
    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("serialize stats")?
        );
    } else {
        println!("device:       {}", stats.device);
        println!("replicas:     {}", stats.backing_count);
        println!("writes:       {}", stats.writes);
        println!("fua:          {}", stats.fua);
        println!("flushes:      {}", stats.flushes + stats.flush_nops);
        println!("completions:  {}", stats.completions);
        println!("errors:       {}", stats.errors);
        if let Some(mean) = stats.mean_latency_us() {
            println!("mean latency: {mean} us");
        }
        println!("elapsed:      {elapsed:?}");
    }
    Ok(())
}

/// Block contents identifying block `n`.
fn pattern(n: u64) -> Vec<u8> {
    let mut block = vec![0_u8; LOGICAL_BLOCK_SIZE as usize];
    for (chunk, word) in block.chunks_exact_mut(8).zip(0_u64..) {
        chunk.copy_from_slice(&(n ^ word.rotate_left(17)).to_le_bytes());
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn exercise_options_parse_paths_and_flags() {
        let options =
            ExerciseOptions::parse(args(&["--requests", "8", "--json", "/a", "/b"])).expect("parse");
        assert_eq!(options.requests, 8);
        assert!(options.json);
        assert_eq!(options.config.paths, vec!["/a", "/b"]);
    }

    #[test]
    fn exercise_requires_a_path() {
        assert!(ExerciseOptions::parse(args(&["--requests", "8"])).is_err());
        assert!(ExerciseOptions::parse(args(&["--bogus", "/a"])).is_err());
        assert!(ExerciseOptions::parse(args(&["--requests", "x", "/a"])).is_err());
    }

    #[test]
    fn patterns_differ_per_block() {
        assert_ne!(pattern(1), pattern(2));
        assert_eq!(pattern(3).len(), LOGICAL_BLOCK_SIZE as usize);
    }

    #[test]
    fn exercise_against_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths: Vec<String> = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("r{i}.img"));
                std::fs::write(&path, vec![0_u8; 16 * 4096]).expect("create");
                path.to_str().expect("utf8").to_owned()
            })
            .collect();
        let options = ExerciseOptions {
            config: DeviceConfig {
                paths,
                ..DeviceConfig::default()
            },
            requests: 16,
            fua_every: 4,
            json: true,
        };
        exercise(&options).expect("exercise");
    }
}
