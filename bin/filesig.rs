//! CLI driver: parses arguments, drives a [`filesig::Pipeline`], and
//! writes the resulting signature file. Thin by design - all control
//! flow lives on the library types this binary just wires together.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use filesig::{
    BlockReader, Crc32Hasher, FilesigError, Hasher, MmapReader, Pipeline, PipelineConfig,
    ReaderKind, Sha256Hasher, StreamingReader, WaitResult,
};

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum HashArg {
    Crc32,
    Sha256,
}

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum ReaderArg {
    Stream,
    Map,
    Mapall,
}

impl From<ReaderArg> for ReaderKind {
    fn from(value: ReaderArg) -> Self {
        match value {
            ReaderArg::Stream => ReaderKind::Streaming,
            ReaderArg::Map => ReaderKind::Map,
            ReaderArg::Mapall => ReaderKind::MapAll,
        }
    }
}

/// Compute a parallel, order-preserving content signature for a file.
#[derive(Parser)]
#[command(name = "filesig", version, about)]
struct Args {
    /// Path to the file the signature will be calculated for.
    #[arg(long)]
    file: PathBuf,

    /// Output file; defaults to `<file>.signature`.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Hash function applied to each block.
    #[arg(long, value_enum, default_value_t = HashArg::Crc32)]
    hash: HashArg,

    /// Reader backend.
    #[arg(long, value_enum, default_value_t = ReaderArg::Stream)]
    reader: ReaderArg,

    /// Block size in bytes; defaults to 1 MiB.
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Worker thread count; defaults to the reader's recommendation.
    #[arg(long)]
    workers: Option<usize>,

    /// Print a hash/progress line to stderr on every pipeline wakeup.
    #[arg(long)]
    verbose: bool,
}

/// How the wait loop ended.
enum Outcome {
    Finished,
    Canceled,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "filesig=debug" } else { "filesig=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(args) {
        error!(error = %err, "filesig failed");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> filesig::Result<()> {
    let file_size = std::fs::metadata(&args.file)?.len();
    let out_path = args.out.clone().unwrap_or_else(|| default_out_path(&args.file));

    let reader_kind: ReaderKind = args.reader.into();
    let mut config = PipelineConfig::new(reader_kind);
    if let Some(chunk_size) = args.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    let chunk_size = config.chunk_size;
    let worker_count = config.worker_count;

    info!(file = %args.file.display(), %file_size, worker_count, "starting");

    let hasher: Arc<dyn Hasher> = match args.hash {
        HashArg::Crc32 => Arc::new(Crc32Hasher),
        HashArg::Sha256 => Arc::new(Sha256Hasher),
    };
    let hash_name = match args.hash {
        HashArg::Crc32 => "crc32",
        HashArg::Sha256 => "sha256",
    };

    let reader: Arc<dyn BlockReader> = match reader_kind {
        ReaderKind::Streaming => Arc::new(StreamingReader::new(&args.file, config.cached_chunks_count, chunk_size)?),
        ReaderKind::Map => Arc::new(MmapReader::new(&args.file, chunk_size, false)?),
        ReaderKind::MapAll => Arc::new(MmapReader::new(&args.file, chunk_size, true)?),
    };

    // Write to a temp file in the destination directory so a canceled or
    // failed run never leaves a partial signature file at `out_path`.
    let out_dir = out_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(out_dir)?;
    let mut header = BufWriter::new(temp.reopen()?);
    write!(header, "Filename: {}\r\n", args.file.display())?;
    write!(header, "Filesize: {file_size}\r\n")?;
    write!(header, "Hash: {hash_name}\r\n")?;
    header.flush()?;
    let out_writer = Arc::new(Mutex::new(header));

    let hashes_emitted = Arc::new(AtomicU64::new(0));
    let bytes_emitted = Arc::new(AtomicU64::new(0));

    let mut pipeline = Pipeline::new(reader, hasher, worker_count);
    {
        let out_writer = out_writer.clone();
        let hashes_emitted = hashes_emitted.clone();
        let bytes_emitted = bytes_emitted.clone();
        pipeline.set_records_callback(move |record| {
            let mut w = out_writer.lock().expect("writer mutex poisoned");
            if let Err(err) = write!(w, "{record}\r\n") {
                error!(%err, "failed writing signature line");
            }
            hashes_emitted.fetch_add(1, Ordering::Relaxed);
            bytes_emitted.store(record.end_offset(), Ordering::Relaxed);
        });
    }

    let cancel_requested = Arc::new(AtomicBool::new(false));
    {
        let cancel_requested = cancel_requested.clone();
        let _ = ctrlc::set_handler(move || {
            cancel_requested.store(true, Ordering::SeqCst);
        });
    }

    let start = Instant::now();
    let outcome = wait_for_completion(&pipeline, &cancel_requested, &hashes_emitted, &bytes_emitted, file_size)?;

    if matches!(outcome, Outcome::Canceled) {
        pipeline.cancel(true)?;
    }
    drop(pipeline);
    out_writer.lock().expect("writer mutex poisoned").flush()?;

    match outcome {
        Outcome::Canceled => {
            eprintln!("\rStopped; no signature file was written.");
            Ok(())
        }
        Outcome::Finished => {
            temp.persist(&out_path).map_err(|e| FilesigError::Io(e.error))?;
            let elapsed = start.elapsed();
            println!(
                "\rFinished: {} hashes, {} bytes in {:.2}s -> {}",
                hashes_emitted.load(Ordering::Relaxed),
                bytes_emitted.load(Ordering::Relaxed),
                elapsed.as_secs_f64(),
                out_path.display()
            );
            Ok(())
        }
    }
}

fn wait_for_completion(
    pipeline: &Pipeline,
    cancel_requested: &AtomicBool,
    hashes_emitted: &AtomicU64,
    bytes_emitted: &AtomicU64,
    file_size: u64,
) -> filesig::Result<Outcome> {
    loop {
        if cancel_requested.load(Ordering::SeqCst) {
            eprintln!("\nCanceling...");
            return Ok(Outcome::Canceled);
        }

        match pipeline.wait(Duration::from_millis(500))? {
            WaitResult::Finished => return Ok(Outcome::Finished),
            WaitResult::Canceled => return Ok(Outcome::Canceled),
            WaitResult::Timeout | WaitResult::Ready(_) => {
                print_progress(hashes_emitted, bytes_emitted, file_size);
            }
        }
    }
}

fn print_progress(hashes: &AtomicU64, bytes: &AtomicU64, file_size: u64) {
    let hashes = hashes.load(Ordering::Relaxed);
    let bytes = bytes.load(Ordering::Relaxed);
    let percent = if file_size == 0 { 100.0 } else { 100.0 * bytes as f64 / file_size as f64 };
    eprint!("\r{percent:.2}% hashes:{hashes}");
    let _ = std::io::stderr().flush();
}

fn default_out_path(file: &Path) -> PathBuf {
    let mut out = file.as_os_str().to_owned();
    out.push(".signature");
    PathBuf::from(out)
}
