use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framefetch::cli::{AccessPattern, Args};
use framefetch::config::PrefetchConfig;
use framefetch::core::prefetcher::Prefetcher;
use framefetch::entities::clip::Clip;
use framefetch::entities::env::{Environment, ThreadEnv};
use framefetch::entities::synthetic::SyntheticClip;

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| PathBuf::from("framefetch.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Defaults -> config file -> environment -> CLI
fn resolve_config(args: &Args) -> Result<PrefetchConfig> {
    let config = match &args.config {
        Some(path) => PrefetchConfig::load(path)?,
        None => PrefetchConfig::default(),
    };
    let mut config = config.apply_process_env();
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    Ok(config.normalized())
}

/// Frame indices the demo requests, in order
fn request_sequence(pattern: AccessPattern, frames: i32, stride: i32, count: usize) -> Vec<i32> {
    match pattern {
        AccessPattern::Sequential => (0..count).map(|i| (i as i64 % frames as i64) as i32).collect(),
        AccessPattern::Strided => {
            let start = if stride < 0 { frames as i64 - 1 } else { 0 };
            (0..count)
                .map(|i| (start + i as i64 * stride as i64).rem_euclid(frames as i64) as i32)
                .collect()
        }
        AccessPattern::Erratic => {
            // xorshift: reproducible jumps mixed with short sequential runs
            let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
            let mut n = 0i64;
            (0..count)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    n = if state % 4 == 0 {
                        (state >> 8) as i64 % frames as i64
                    } else {
                        (n + 1) % frames as i64
                    };
                    n as i32
                })
                .collect()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    debug!("Command-line args: {:?}", args);

    if args.frames <= 0 {
        bail!("--frames must be positive (got {})", args.frames);
    }

    let config = resolve_config(&args)?;
    info!(
        "Prefetch config: threads={}, window={}, cache={}",
        config.threads,
        config.prefetch_window(),
        config.cache_capacity()
    );

    let env = Environment::new();
    let main_env = ThreadEnv::main(&env);
    let clip = Arc::new(
        SyntheticClip::new(args.frames, args.width, args.height)
            .with_cost(Duration::from_millis(args.cost_ms)),
    );
    let reference = SyntheticClip::new(args.frames, args.width, args.height);
    let prefetcher =
        Prefetcher::with_config(clip.clone(), &config, &env).context("Failed to create prefetcher")?;

    let requests = request_sequence(args.pattern, args.frames, args.stride, args.count);
    info!("Requesting {} frames ({:?})", requests.len(), args.pattern);

    let start = Instant::now();
    let mut mismatches = 0usize;
    for &n in &requests {
        let frame = prefetcher
            .get_frame(n, &main_env)
            .with_context(|| format!("Failed to read frame {}", n))?;
        let expected = reference
            .get_frame(n, &main_env)
            .with_context(|| format!("Failed to build reference frame {}", n))?;
        if frame != expected {
            error!("Frame {} differs from direct read", n);
            mismatches += 1;
        }
    }
    let elapsed = start.elapsed();

    prefetcher.wait_idle();
    let stats = prefetcher.cache_stats();
    let pattern = prefetcher.pattern_state();

    println!(
        "{} frames in {:.1} ms ({:.2} ms/frame), upstream cost {} ms/frame",
        requests.len(),
        elapsed.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0 / requests.len().max(1) as f64,
        args.cost_ms
    );
    println!(
        "cache: {} hits, {} misses ({:.1}% hit rate), {} evictions, {} rollbacks, {} resident",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0,
        stats.evictions,
        stats.rollbacks,
        stats.size
    );
    println!(
        "upstream calls: {} ({} on workers), pattern: {}",
        clip.calls(),
        clip.worker_calls(),
        if pattern.is_locked {
            format!("locked at stride {}", pattern.locked_pattern)
        } else {
            "unlocked".to_string()
        }
    );

    if mismatches > 0 {
        bail!("{} of {} frames did not match direct reads", mismatches, requests.len());
    }
    info!("All {} frames verified", requests.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_sequence_wraps() {
        assert_eq!(request_sequence(AccessPattern::Strided, 10, 4, 4), vec![0, 4, 8, 2]);
        assert_eq!(request_sequence(AccessPattern::Strided, 10, -3, 3), vec![9, 6, 3]);
    }

    #[test]
    fn test_erratic_sequence_in_range() {
        let seq = request_sequence(AccessPattern::Erratic, 50, 1, 500);
        assert_eq!(seq.len(), 500);
        assert!(seq.iter().all(|&n| (0..50).contains(&n)));
        assert_eq!(seq, request_sequence(AccessPattern::Erratic, 50, 1, 500));
    }
}
