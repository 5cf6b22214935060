use clap::{Parser, ValueEnum};
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Order in which the demo requests frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AccessPattern {
    /// 0, 1, 2, ...
    Sequential,
    /// 0, S, 2S, ... (see --stride)
    Strided,
    /// Pseudo-random jumps
    Erratic,
}

/// Read a synthetic clip through the look-ahead prefetcher and verify every frame
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Worker threads (default: physical cores, or FRAMEFETCH_THREADS)
    #[arg(short = 't', long = "threads", value_name = "N")]
    pub threads: Option<usize>,

    /// Frames in the synthetic clip
    #[arg(long = "frames", value_name = "N", default_value_t = 1000)]
    pub frames: i32,

    /// Simulated decode cost per frame, in milliseconds
    #[arg(long = "cost-ms", value_name = "MS", default_value_t = 5)]
    pub cost_ms: u64,

    /// Access pattern
    #[arg(short = 'p', long = "pattern", value_enum, default_value = "sequential")]
    pub pattern: AccessPattern,

    /// Stride for --pattern strided (negative walks backwards)
    #[arg(short = 's', long = "stride", default_value_t = 3, allow_hyphen_values = true)]
    pub stride: i32,

    /// Number of frames to request
    #[arg(short = 'n', long = "count", value_name = "N", default_value_t = 200)]
    pub count: usize,

    /// Frame width of the synthetic clip
    #[arg(long = "width", default_value_t = 320)]
    pub width: usize,

    /// Frame height of the synthetic clip
    #[arg(long = "height", default_value_t = 180)]
    pub height: usize,

    /// Load prefetch settings from a JSON file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable logging to file (default: framefetch.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
