use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;

#[derive(Debug, Parser)]
#[command(name = "opsbook", version, about = "Scenario-driven operations runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the runbooks matched by the path pattern.
    Run {
        /// Book path, directory, or glob (`books/**/*.yml`).
        pattern: String,
        /// Run up to N operators concurrently.
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,
        /// Abort the whole run on the first failure.
        #[arg(long)]
        fail_fast: bool,
        /// Shuffle the running order with this seed.
        #[arg(long, value_name = "SEED")]
        shuffle: Option<u64>,
        /// Number of shards to split the run into.
        #[arg(long, value_name = "N", requires = "shard_index")]
        shard_n: Option<usize>,
        /// Which shard to run (0-based).
        #[arg(long, value_name = "I", requires = "shard_n")]
        shard_index: Option<usize>,
        /// Run only N books, sampled without replacement.
        #[arg(long, value_name = "N")]
        sample: Option<usize>,
        /// Run N books drawn with replacement.
        #[arg(long, value_name = "N")]
        random: Option<usize>,
        /// Skip books that other selected books include.
        #[arg(long)]
        skip_included: bool,
        /// Regex over book paths (also read from OPSBOOK_RUN).
        #[arg(long, value_name = "REGEX")]
        run_match: Option<String>,
        /// Skip every test section.
        #[arg(long)]
        skip_test: bool,
        /// Print a step-by-step trace.
        #[arg(long)]
        debug: bool,
        /// Write timing spans as JSON to this file.
        #[arg(long, value_name = "PATH")]
        profile_out: Option<std::path::PathBuf>,
    },
    /// List the books the path pattern selects, in running order.
    List {
        pattern: String,
        #[arg(long, value_name = "REGEX")]
        run_match: Option<String>,
        #[arg(long)]
        skip_included: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };
    let exit_code = rt.block_on(commands::dispatch(cli.command));
    std::process::exit(exit_code);
}
