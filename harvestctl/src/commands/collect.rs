use std::path::PathBuf;

use clap::Args;

/// Runs one collection pass over the configured listing page.
#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    /// Stop after this many unique items (overrides collection.max_items)
    #[arg(short = 'm', long)]
    pub max_items: Option<usize>,

    /// Launch the browser with a visible window
    #[arg(long)]
    pub no_headless: bool,

    /// Seconds to wait for a pooled session (overrides pool.max_wait_seconds)
    #[arg(long, value_name = "SECONDS")]
    pub acquire_timeout: Option<u64>,

    /// Directory to write result files into; nothing is written when omitted
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}
