//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch, verify and organize academic paper full-texts.
///
/// Harvester works through a pipe-delimited work list, writes verified files
/// under `<output>/data/`, and records progress in a state database so an
/// interrupted run resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Work list: one `id | doi | author | title | url [| year]` record per line
    #[arg(value_name = "WORK_LIST")]
    pub work_list: PathBuf,

    /// Output root for data/, logs/ and the run summary [default: .]
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// State database [default: <output>/harvest_state.db]
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Maximum concurrent fetch chains (1-100) [default: 5]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_concurrent: Option<u8>,

    /// Minimum seconds between one worker's Direct requests [default: 1.0]
    #[arg(long, value_parser = parse_seconds)]
    pub delay: Option<f64>,

    /// Minimum seconds between one worker's mirror requests [default: 5.0]
    #[arg(long, value_parser = parse_seconds)]
    pub mirror_delay: Option<f64>,

    /// Never try mirror routes
    #[arg(long, conflicts_with = "mirror_only")]
    pub disable_mirror_fallback: bool,

    /// Skip the Direct route and use mirrors only
    #[arg(long)]
    pub mirror_only: bool,

    /// Accept any non-empty body without content verification
    #[arg(long)]
    pub no_verify: bool,

    /// HEAD each Direct URL first and skip known-unusable content types
    #[arg(long)]
    pub check_content_type: bool,

    /// Mirror base URL queried as <BASE_URL>/<doi> (repeatable, tried in order)
    #[arg(long = "mirror", value_name = "BASE_URL")]
    pub mirrors: Vec<String>,

    /// Per-request timeout in seconds (1-3600) [default: 30]
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Requests per route including micro-retries (1-10) [default: 3]
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_attempts: Option<u8>,

    /// Config file [default: $XDG_CONFIG_HOME/harvester/config.toml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_seconds(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("'{raw}' must be a non-negative number of seconds"));
    }
    Ok(value)
}
