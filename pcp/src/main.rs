use anyhow::anyhow;
use clap::Parser;
use tracing::instrument;

const USAGE: &str = "Usage: pcp [options] <source> <destination>";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pcp",
    version,
    about = "Copy a file or directory tree while showing progress - like `cp` with a live status line",
    long_about = "`pcp` copies a single file or a whole directory tree and keeps one status line updated \
with the bytes copied, percentage, current rate and estimated time remaining.

If the destination is an existing directory the source is copied into it under its own name. \
A file destination is overwritten. A directory is never merged into an existing one.

Symbolic links inside a copied directory are skipped.

EXAMPLES:
    # Copy a file
    pcp big.iso /mnt/backup/

    # Copy a directory tree, syncing less eagerly
    pcp photos /mnt/backup/photos --no-fsync"
)]
struct Args {
    // Copy options
    /// Number of bytes moved by a single read/write step
    ///
    /// Accepts byte sizes like "4KiB", "1MiB" or plain numbers in bytes.
    #[arg(
        long,
        default_value = "4096",
        value_name = "SIZE",
        help_heading = "Copy options"
    )]
    chunk_size: bytesize::ByteSize,

    /// Don't sync each destination file to storage before moving on
    #[arg(long, help_heading = "Copy options")]
    no_fsync: bool,

    // Progress & output
    /// Number of chunks between progress updates
    #[arg(
        long,
        default_value = "1000",
        value_name = "N",
        help_heading = "Progress & output"
    )]
    progress_freq: u64,

    /// Number of progress updates between rate and time remaining re-estimation
    #[arg(
        long,
        default_value = "50",
        value_name = "N",
        help_heading = "Progress & output"
    )]
    rate_freq: u64,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path and destination path
    #[arg()]
    paths: Vec<std::path::PathBuf>,
}

impl Args {
    fn transfer_config(&self) -> common::TransferConfig {
        common::TransferConfig {
            chunk_size: self.chunk_size.0,
            progress_freq: self.progress_freq,
            rate_freq: self.rate_freq,
            fsync: !self.no_fsync,
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::copy::Summary> {
    let config = args.transfer_config();
    config.validate().map_err(|error| anyhow!(error))?;
    let [src, dst] = args.paths.as_slice() else {
        return Err(anyhow!("expected exactly one source and one destination"));
    };
    let task = common::TransferTask::resolve(src, dst).await?;
    tracing::info!("copy: {:?} -> {:?}", task.src(), task.dst());
    common::copy_with_progress(task, &config, std::io::stdout()).await
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    if args.paths.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    if args.paths.len() > 2 {
        eprintln!("pcp copies a single source, got {} paths", args.paths.len());
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
