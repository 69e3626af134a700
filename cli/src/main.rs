use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunkdl_core::checksum::{verify_package, ChecksumRequest, ChecksumType};
use chunkdl_core::store::{PackageStore, SqlitePackageStore};
use chunkdl_core::{
    CoreError, DownloadCompletion, DownloadConfig, DownloadEvent, DownloadPackage, DownloadService,
    PackageId,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Options {
    urls: Vec<String>,
    output: Option<PathBuf>,
    directory: Option<PathBuf>,
    state: Option<PathBuf>,
    checksum: Option<ChecksumRequest>,
    config: DownloadConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "get" => match parse_options(&args[2..]) {
            Ok(options) if !options.urls.is_empty() => run_get(options).await,
            Ok(_) => {
                print_usage();
                return;
            }
            Err(err) => Err(err),
        },
        "resume" => {
            let source = match args.get(2) {
                Some(value) => value.to_string(),
                None => {
                    print_usage();
                    return;
                }
            };
            match parse_options(&args[3..]) {
                Ok(options) => run_resume(&source, options).await,
                Err(err) => Err(err),
            }
        }
        "list" => run_list(),
        _ => {
            print_usage();
            return;
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn parse_options(args: &[String]) -> Result<Options, CoreError> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let name = arg.as_str();
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| CoreError::InvalidState(format!("{} needs a value", name)))
        };
        match name {
            "-o" | "--output" => options.output = Some(PathBuf::from(value()?)),
            "-d" | "--dir" => options.directory = Some(PathBuf::from(value()?)),
            "-p" | "--parallel" => options.config.parallel_count = parse_number(name, &value()?)?,
            "-c" | "--chunks" => options.config.chunk_count = parse_number(name, &value()?)?,
            "-l" | "--limit" => options.config.max_bytes_per_second = parse_number(name, &value()?)?,
            "-r" | "--retries" => options.config.retry_count = parse_number(name, &value()?)?,
            "--config" => {
                let json = std::fs::read_to_string(value()?)?;
                options.config = serde_json::from_str(&json)
                    .map_err(|err| CoreError::InvalidState(format!("bad config file: {}", err)))?;
            }
            "--state" => options.state = Some(PathBuf::from(value()?)),
            "--checksum" => options.checksum = Some(parse_checksum(&value()?)?),
            "--clear-on-failure" => options.config.clear_package_on_completion_with_failure = true,
            "--proxy" => options.config.request.proxy = Some(value()?),
            "--insecure" => options.config.request.accept_invalid_certs = true,
            other if other.starts_with('-') => {
                return Err(CoreError::InvalidState(format!("unknown option {}", other)))
            }
            url => options.urls.push(url.to_string()),
        }
    }
    if options.output.is_some() && options.directory.is_some() {
        return Err(CoreError::InvalidState("use either -o or -d".to_string()));
    }
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, CoreError> {
    value
        .parse::<T>()
        .map_err(|_| CoreError::InvalidState(format!("{} expects a number, got {}", name, value)))
}

/// `sha256:<hex>`, `sha1:<hex>` or `md5:<hex>`.
fn parse_checksum(value: &str) -> Result<ChecksumRequest, CoreError> {
    let (kind, hex) = value
        .split_once(':')
        .ok_or_else(|| CoreError::InvalidState(format!("checksum must be type:hex, got {}", value)))?;
    let checksum_type = ChecksumType::parse(kind)
        .ok_or_else(|| CoreError::InvalidState(format!("unknown checksum type {}", kind)))?;
    Ok(ChecksumRequest {
        checksum_type,
        expected_hex: hex.to_string(),
    })
}

fn open_store() -> Result<Option<SqlitePackageStore>, CoreError> {
    match env::var("CHUNKDL_DB") {
        Ok(path) => Ok(Some(SqlitePackageStore::new(path)?)),
        Err(_) => Ok(None),
    }
}

async fn run_get(options: Options) -> Result<(), CoreError> {
    let service = Arc::new(DownloadService::new(options.config.clone())?);
    let cancel = CancellationToken::new();
    let urls = options.urls.clone();
    let task = {
        let service = Arc::clone(&service);
        let output = options.output.clone();
        let directory = options.directory.clone();
        let cancel = Some(cancel.clone());
        tokio::spawn(async move {
            match (output, directory) {
                (Some(path), _) => service.download_to_file(urls, path, cancel).await,
                (None, Some(dir)) => service.download_to_dir(urls, dir, cancel).await,
                (None, None) => service.download_to_dir(urls, ".", cancel).await,
            }
        })
    };
    drive(service, task, cancel, &options).await
}

async fn run_resume(source: &str, options: Options) -> Result<(), CoreError> {
    let (package, state) = match PackageId::parse_str(source) {
        Ok(id) => {
            let store = open_store()?
                .ok_or_else(|| CoreError::InvalidState("CHUNKDL_DB is not set".to_string()))?;
            (store.load_package(&id)?, options.state.clone())
        }
        Err(_) => {
            let json = std::fs::read_to_string(source)?;
            (DownloadPackage::from_json(&json)?, Some(PathBuf::from(source)))
        }
    };
    println!("resuming {} ({} chunks)", package.id, package.chunks.len());

    let service = Arc::new(DownloadService::new(options.config.clone())?);
    let cancel = CancellationToken::new();
    let task = {
        let service = Arc::clone(&service);
        let cancel = Some(cancel.clone());
        tokio::spawn(async move { service.download_package(package, cancel).await })
    };
    let options = Options { state, ..options };
    drive(service, task, cancel, &options).await
}

fn run_list() -> Result<(), CoreError> {
    let store =
        open_store()?.ok_or_else(|| CoreError::InvalidState("CHUNKDL_DB is not set".to_string()))?;
    for package in store.list_packages()? {
        let name = package
            .file_name
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "(memory)".to_string());
        println!(
            "{}\t{}\t{:.1}%\t{}",
            package.id,
            package.status,
            package.progress_percentage(),
            name
        );
    }
    Ok(())
}

/// Prints progress, stops on Ctrl-C and persists the package when the
/// download did not finish.
async fn drive(
    service: Arc<DownloadService>,
    mut task: tokio::task::JoinHandle<Result<DownloadCompletion, CoreError>>,
    cancel: CancellationToken,
    options: &Options,
) -> Result<(), CoreError> {
    let progress = spawn_progress(Arc::clone(&service));

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\ninterrupted, stopping");
            cancel.cancel();
            service.cancel_and_wait().await;
            task.await
        }
    };
    progress.abort();
    let completion = joined
        .map_err(|err| CoreError::InvalidState(format!("download task failed: {}", err)))??;

    let package = service.package()?;
    match &completion {
        DownloadCompletion::Success => {
            if let Some(req) = &options.checksum {
                verify_package(&package, req).await?;
                println!("{} ok", req.checksum_type.as_str());
            }
            if let Some(state) = &options.state {
                remove_state(state);
            }
            forget_package(&package);
            println!(
                "done: {} ({})",
                package
                    .file_name
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "memory".to_string()),
                format_bytes(package.received_bytes_size)
            );
            Ok(())
        }
        DownloadCompletion::Cancelled | DownloadCompletion::Failed(_) => {
            save_package(&package, options.state.as_deref())?;
            completion.into_result()
        }
    }
}

fn save_package(package: &DownloadPackage, state: Option<&Path>) -> Result<(), CoreError> {
    if let Some(path) = state {
        std::fs::write(path, package.to_json()?)?;
        println!("state saved to {}", path.display());
    }
    if let Some(mut store) = open_store()? {
        store.save_package(package)?;
        println!("package {} saved", package.id);
    }
    Ok(())
}

fn forget_package(package: &DownloadPackage) {
    match open_store() {
        Ok(Some(mut store)) => {
            if let Err(err) = store.delete_package(&package.id) {
                warn!(error = %err, "could not remove finished package");
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "could not open package store"),
    }
}

fn remove_state(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %err, "state file not removed");
    }
}

fn print_usage() {
    eprintln!(
        "Usage: chunkdl <command> [args]\n\
Commands:\n\
  get <url> [mirror...] [options]   Download a resource\n\
  resume <state.json|id> [options]  Continue a saved download\n\
  list                              List saved downloads (needs CHUNKDL_DB)\n\
Options:\n\
  -o, --output <file>       Destination file\n\
  -d, --dir <dir>           Destination directory, name taken from the server\n\
  -p, --parallel <n>        Chunks fetched at once\n\
  -c, --chunks <n>          Number of chunks\n\
  -l, --limit <bytes/s>     Bandwidth limit, 0 for none\n\
  -r, --retries <n>         Retries per chunk\n\
  --config <file.json>      Load settings from JSON, later flags override\n\
  --state <file.json>       Where to save progress when interrupted\n\
  --checksum <type:hex>     Verify sha256, sha1 or md5 after download\n\
  --clear-on-failure        Delete partial data when the download fails\n\
  --proxy <url>             Proxy for all requests\n\
  --insecure                Accept invalid TLS certificates\n\
Environment:\n\
  CHUNKDL_DB=/path/to/db    Persist interrupted downloads in SQLite\n\
  RUST_LOG=debug            Log filter"
    );
}

fn spawn_progress(service: Arc<DownloadService>) -> tokio::task::JoinHandle<()> {
    let mut rx = service.subscribe();
    tokio::spawn(async move {
        let mut name = String::from("download");
        let mut last_print: Option<Instant> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress events skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                DownloadEvent::Started {
                    file_name,
                    total_bytes_to_receive,
                } => {
                    if let Some(value) = file_name
                        .as_ref()
                        .and_then(|path| path.file_name())
                        .and_then(|value| value.to_str())
                    {
                        name = value.to_string();
                    }
                    let total = if total_bytes_to_receive > 0 {
                        format_bytes(total_bytes_to_receive)
                    } else {
                        "unknown size".to_string()
                    };
                    println!("[started] {} ({})", name, total);
                }
                DownloadEvent::Progress(info) => {
                    if last_print.is_some_and(|at| at.elapsed() < Duration::from_secs(1)) {
                        continue;
                    }
                    last_print = Some(Instant::now());
                    let total = info.total_bytes_to_receive;
                    let downloaded = info.received_bytes_size;
                    let speed_bps = info.bytes_per_second_speed as u64;
                    let percent = if total > 0 {
                        format!("{:.1}%", info.progress_percentage)
                    } else {
                        "--".to_string()
                    };
                    let eta = if total > 0 && speed_bps > 0 {
                        format_duration(total.saturating_sub(downloaded) / speed_bps)
                    } else {
                        "--:--".to_string()
                    };
                    println!(
                        "[{}] {} {}/{} ({}/s) eta {} {} active",
                        service.status(),
                        percent,
                        format_bytes(downloaded),
                        if total > 0 { format_bytes(total) } else { "?".to_string() },
                        format_bytes(speed_bps),
                        eta,
                        info.active_chunks,
                    );
                }
                DownloadEvent::Completed(_) => break,
                DownloadEvent::ChunkProgress(_) => {}
            }
        }
    })
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
