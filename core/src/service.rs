use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandwidth::Bandwidth;
use crate::chunk::Chunk;
use crate::chunk_downloader::{ChunkContext, ChunkDownloader, ChunkObserver};
use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{DownloadCompletion, DownloadEvent, ProgressInfo};
use crate::hub::{ChunkHub, PreviousRun};
use crate::net::{HttpTransport, ReqwestTransport};
use crate::package::{DownloadPackage, DownloadStatus};
use crate::packet::PacketPool;
use crate::pause::PauseCoordinator;
use crate::request::{Request, ResourceInfo};
use crate::storage::{FileStorage, MemoryStorage, StorageBackend};
use crate::throttle::Throttle;

const EVENT_CAPACITY: usize = 1024;
const IDLE_PACKET_BUFFERS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum RunPhase {
    Idle,
    Running,
    Done(DownloadCompletion),
}

/// State owned by one `initialize` call and torn down by `clear`.
#[derive(Clone)]
struct Run {
    cancel: CancellationToken,
    limiter: Arc<Semaphore>,
    parallel_count: usize,
    requests: Vec<Request>,
    hub: ChunkHub,
    phase: Arc<watch::Sender<RunPhase>>,
}

/// Orchestrates one logical download: probe, partition, bounded parallel
/// chunk fetches, progress, pause/resume/cancel and finalization.
pub struct DownloadService {
    config: Arc<DownloadConfig>,
    transport: Arc<dyn HttpTransport>,
    package: Arc<Mutex<DownloadPackage>>,
    pause: Arc<PauseCoordinator>,
    bandwidth: Arc<Bandwidth>,
    throttle: Throttle,
    pool: Arc<PacketPool>,
    events: broadcast::Sender<DownloadEvent>,
    run: Mutex<Option<Run>>,
    teardown: tokio::sync::Mutex<()>,
}

impl DownloadService {
    pub fn new(config: DownloadConfig) -> CoreResult<Self> {
        let transport = ReqwestTransport::new(&config.request)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: DownloadConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            throttle: Throttle::new(config.max_bytes_per_second),
            pool: PacketPool::new(config.buffer_block_size(), IDLE_PACKET_BUFFERS),
            config: Arc::new(config),
            transport,
            package: Arc::new(Mutex::new(DownloadPackage::default())),
            pause: Arc::new(PauseCoordinator::new()),
            bandwidth: Arc::new(Bandwidth::default()),
            events,
            run: Mutex::new(None),
            teardown: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Event stream of this service. Receivers that fall behind by more than
    /// the channel capacity observe `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    fn lock_package(&self) -> CoreResult<MutexGuard<'_, DownloadPackage>> {
        self.package
            .lock()
            .map_err(|_| CoreError::Storage("package lock poisoned".to_string()))
    }

    fn lock_run(&self) -> CoreResult<MutexGuard<'_, Option<Run>>> {
        self.run
            .lock()
            .map_err(|_| CoreError::Storage("run lock poisoned".to_string()))
    }

    fn current_run(&self) -> Option<Run> {
        self.lock_run().ok().and_then(|run| run.clone())
    }

    /// Snapshot of the package, suitable for persisting.
    pub fn package(&self) -> CoreResult<DownloadPackage> {
        Ok(self.lock_package()?.clone())
    }

    /// Installs `package` as the one this service drives.
    pub fn load_package(&self, package: DownloadPackage) -> CoreResult<()> {
        if self.is_transferring() {
            return Err(CoreError::InvalidState("download is running".to_string()));
        }
        *self.lock_package()? = package;
        Ok(())
    }

    /// A blank package for `urls` that keeps the identity of the current one.
    fn fresh_package(&self, urls: &[String]) -> CoreResult<DownloadPackage> {
        let mut package = DownloadPackage::new(urls.to_vec());
        package.id = self.lock_package()?.id;
        Ok(package)
    }

    pub fn status(&self) -> DownloadStatus {
        self.lock_package()
            .map(|package| package.status)
            .unwrap_or_default()
    }

    fn move_status(&self, from: &[DownloadStatus], to: DownloadStatus) {
        if let Ok(mut package) = self.lock_package() {
            if from.contains(&package.status) {
                package.status = to;
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status() == DownloadStatus::Running
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_run()
            .map(|run| run.cancel.is_cancelled())
            .unwrap_or(false)
    }

    fn is_transferring(&self) -> bool {
        self.current_run()
            .map(|run| *run.phase.borrow() == RunPhase::Running)
            .unwrap_or(false)
    }

    /// Chunk tasks currently holding a concurrency slot.
    pub fn active_chunks(&self) -> usize {
        self.current_run()
            .map(|run| run.parallel_count.saturating_sub(run.limiter.available_permits()))
            .unwrap_or(0)
    }

    pub fn max_bytes_per_second(&self) -> u64 {
        self.throttle.limit()
    }

    /// Changes the throttle of the running download; zero lifts the limit.
    pub fn set_max_bytes_per_second(&self, limit: u64) {
        debug!(limit, "bandwidth limit changed");
        self.throttle.set_limit(limit);
    }

    pub fn pause(&self) {
        self.pause.pause();
        self.move_status(&[DownloadStatus::Running], DownloadStatus::Paused);
    }

    pub fn resume(&self) {
        if self.pause.is_paused() {
            self.throttle.restart();
        }
        self.pause.resume();
        self.move_status(&[DownloadStatus::Paused], DownloadStatus::Running);
    }

    pub fn cancel(&self) {
        if let Some(run) = self.current_run() {
            run.cancel.cancel();
        }
        self.resume();
        self.move_status(
            &[DownloadStatus::Created, DownloadStatus::Running, DownloadStatus::Paused],
            DownloadStatus::Stopped,
        );
    }

    /// Cancels and returns once the running transfer signalled completion.
    pub async fn cancel_and_wait(&self) {
        self.cancel();
        self.wait_for_completion().await;
    }

    async fn wait_for_completion(&self) {
        let Some(run) = self.current_run() else {
            return;
        };
        let mut phase = run.phase.subscribe();
        let _ = phase.wait_for(|phase| *phase != RunPhase::Running).await;
    }

    /// Tears down the run state. The package is kept.
    pub async fn clear(&self) {
        let _guard = self.teardown.lock().await;
        if self.is_transferring() || self.is_paused() {
            self.cancel_and_wait().await;
        }
        let run = self.lock_run().ok().and_then(|mut run| run.take());
        if let Some(run) = run {
            run.cancel.cancel();
            run.limiter.close();
        }
        self.pause.resume();
        self.bandwidth.reset();
    }

    /// Clears and discards the package together with its storage handle.
    pub async fn dispose(&self) -> CoreResult<()> {
        self.clear().await;
        let mut package = std::mem::take(&mut *self.lock_package()?);
        package.clear().await
    }

    /// Prepares a run for `urls`. The caller's token, when given, cancels the
    /// run together with `cancel()`.
    pub async fn initialize(&self, urls: Vec<String>, cancel: Option<CancellationToken>) -> CoreResult<()> {
        if urls.is_empty() {
            return Err(CoreError::InvalidState("no url to download".to_string()));
        }
        self.clear().await;

        let requests = urls
            .iter()
            .map(|url| Request::new(url.clone(), Arc::clone(&self.transport)))
            .collect::<CoreResult<Vec<_>>>()?;
        let parallel_count = self.config.effective_parallel_count();
        {
            let mut package = self.lock_package()?;
            package.urls = urls;
            package.status = DownloadStatus::Created;
        }
        let (phase, _) = watch::channel(RunPhase::Idle);
        *self.lock_run()? = Some(Run {
            cancel: cancel.map(|token| token.child_token()).unwrap_or_default(),
            limiter: Arc::new(Semaphore::new(parallel_count)),
            parallel_count,
            requests,
            hub: ChunkHub::new(&self.config),
            phase: Arc::new(phase),
        });
        Ok(())
    }

    /// Runs the initialized download to its single completion.
    pub async fn start(&self) -> DownloadCompletion {
        let Some(run) = self.current_run() else {
            return DownloadCompletion::Failed(CoreError::InvalidState(
                "download is not initialized".to_string(),
            ));
        };
        let mut accepted = false;
        run.phase.send_if_modified(|phase| {
            if *phase == RunPhase::Idle {
                *phase = RunPhase::Running;
                accepted = true;
            }
            accepted
        });
        if !accepted {
            return DownloadCompletion::Failed(CoreError::InvalidState(
                "download was already started".to_string(),
            ));
        }

        let completion = match self.transfer(&run).await {
            Ok(()) => DownloadCompletion::Success,
            Err(CoreError::Cancelled) => DownloadCompletion::Cancelled,
            Err(err) => DownloadCompletion::Failed(err),
        };
        self.finish(&run, completion.clone()).await;
        completion
    }

    /// Downloads into memory, or into the configured storage.
    pub async fn download(&self, urls: Vec<String>, cancel: Option<CancellationToken>) -> CoreResult<DownloadCompletion> {
        self.clear().await;
        let mut package = self.fresh_package(&urls)?;
        package.in_memory = true;
        self.load_package(package)?;
        self.initialize(urls, cancel).await?;
        Ok(self.start().await)
    }

    /// Downloads to `path`, creating its directory and replacing any file
    /// already there.
    pub async fn download_to_file(
        &self,
        urls: Vec<String>,
        path: impl AsRef<Path>,
        cancel: Option<CancellationToken>,
    ) -> CoreResult<DownloadCompletion> {
        let path = path.as_ref().to_path_buf();
        self.clear().await;
        let mut package = self.fresh_package(&urls)?;
        package.file_name = Some(path.clone());
        package.in_memory = self.config.in_memory;
        self.load_package(package)?;
        self.initialize(urls, cancel).await?;
        if !self.config.in_memory {
            prepare_destination(&path).await?;
        }
        Ok(self.start().await)
    }

    /// Downloads into `dir` under the name the first source reports.
    pub async fn download_to_dir(
        &self,
        urls: Vec<String>,
        dir: impl AsRef<Path>,
        cancel: Option<CancellationToken>,
    ) -> CoreResult<DownloadCompletion> {
        let file_name = self.lookup_file_name(&urls, cancel.as_ref()).await?;
        let path = dir.as_ref().join(file_name);
        self.download_to_file(urls, path, cancel).await
    }

    /// File name reported by the first source that answers in time.
    async fn lookup_file_name(&self, urls: &[String], cancel: Option<&CancellationToken>) -> CoreResult<String> {
        let cancel = cancel.cloned().unwrap_or_default();
        let mut last_error = None;
        for url in urls {
            let request = Request::new(url.clone(), Arc::clone(&self.transport))?;
            let named = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                named = tokio::time::timeout(self.config.timeout(), request.file_name()) => named
                    .unwrap_or_else(|_| Err(CoreError::Timeout(format!("naming {}", url)))),
            };
            match named {
                Ok(name) => return Ok(name),
                Err(err) => {
                    warn!(url = %url, error = %err, "file name lookup failed, trying next source");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::InvalidState("no url to download".to_string())))
    }

    /// Resumes a package, typically one restored from its serialized form.
    pub async fn download_package(
        &self,
        package: DownloadPackage,
        cancel: Option<CancellationToken>,
    ) -> CoreResult<DownloadCompletion> {
        self.clear().await;
        let urls = package.urls.clone();
        self.load_package(package)?;
        self.initialize(urls, cancel).await?;
        Ok(self.start().await)
    }

    async fn probe(&self, run: &Run) -> CoreResult<ResourceInfo> {
        let mut last_error = None;
        for request in &run.requests {
            let probed = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(CoreError::Cancelled),
                probed = tokio::time::timeout(self.config.timeout(), request.probe()) => probed
                    .unwrap_or_else(|_| Err(CoreError::Timeout(format!("probing {}", request.url())))),
            };
            match probed {
                Ok(info) => {
                    debug!(
                        url = request.url(),
                        size = info.total_size,
                        ranges = info.supports_range,
                        "resource probed"
                    );
                    return Ok(info);
                }
                Err(err) => {
                    warn!(url = request.url(), error = %err, "probe failed, trying next source");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::InvalidState("no url to download".to_string())))
    }

    /// Whether bytes behind the package's chunk positions can still be read.
    async fn has_reusable_bytes(&self) -> CoreResult<bool> {
        let (live_storage, file_name, in_memory) = {
            let package = self.lock_package()?;
            let live = package
                .storage
                .as_ref()
                .map(|storage| !storage.is_disposed())
                .unwrap_or(false);
            (live, package.file_name.clone(), package.in_memory)
        };
        if live_storage {
            return Ok(true);
        }
        match file_name {
            Some(path) if !in_memory => Ok(tokio::fs::try_exists(&path).await?),
            _ => Ok(false),
        }
    }

    async fn prepare_storage(&self, resumed: bool, total_size: u64) -> CoreResult<Arc<dyn StorageBackend>> {
        let (existing, file_name, in_memory) = {
            let mut package = self.lock_package()?;
            (
                package.storage.take(),
                package.file_name.clone(),
                package.in_memory || self.config.in_memory,
            )
        };
        let existing = existing.filter(|storage| !storage.is_disposed());

        let storage: Arc<dyn StorageBackend> = match (existing, file_name) {
            (Some(storage), _) if resumed => storage,
            (stale, file_name) => {
                if let Some(stale) = stale {
                    stale.dispose().await?;
                }
                match file_name {
                    Some(path) if !in_memory => {
                        if !resumed {
                            remove_file_if_exists(&path).await?;
                        }
                        Arc::new(FileStorage::new(path))
                    }
                    _ => Arc::new(MemoryStorage::new()),
                }
            }
        };
        if self.config.reserve_storage_space && total_size > 0 {
            storage.reserve(total_size).await?;
        }
        Ok(storage)
    }

    async fn transfer(&self, run: &Run) -> CoreResult<()> {
        if self.lock_package()?.is_save_complete {
            debug!("package already complete");
            return Ok(());
        }

        let info = self.probe(run).await?;
        let ranged = info.supports_range && info.total_size > 0;

        let reusable = self.has_reusable_bytes().await?;
        let (previous, file_name) = {
            let mut package = self.lock_package()?;
            let mut chunks = std::mem::take(&mut package.chunks);
            if !reusable && chunks.iter().any(|chunk| chunk.received() > 0) {
                warn!("stored bytes of the package are gone, starting over");
                chunks.clear();
            }
            let previous = PreviousRun {
                chunks,
                total_file_size: package.total_file_size,
                supports_range: package.is_support_download_in_range,
            };
            (previous, package.file_name.clone())
        };
        let plan = run.hub.reconcile(previous, info.total_size, ranged);
        let storage = self.prepare_storage(plan.resumed, info.total_size).await?;

        let (limiter, parallel_count) = if ranged {
            (Arc::clone(&run.limiter), run.parallel_count)
        } else {
            self.narrow_to_single_slot(run)?
        };
        {
            let mut package = self.lock_package()?;
            package.chunks = plan.chunks.clone();
            package.total_file_size = info.total_size;
            package.is_support_download_in_range = ranged;
            package.storage = Some(Arc::clone(&storage));
            package.is_saving = true;
            package.is_save_complete = false;
            package.recompute_received();
            package.save_progress = package.progress_percentage();
            package.status = if self.pause.is_paused() {
                DownloadStatus::Paused
            } else {
                DownloadStatus::Running
            };
        }
        info!(
            file = ?file_name,
            size = info.total_size,
            chunks = plan.chunks.len(),
            resumed = plan.resumed,
            "download started"
        );
        self.throttle.restart();
        let _ = self.events.send(DownloadEvent::Started {
            file_name,
            total_bytes_to_receive: info.total_size,
        });

        let chunk_cancel = run.cancel.child_token();
        let ctx = ChunkContext {
            storage: Arc::clone(&storage),
            pool: Arc::clone(&self.pool),
            pause: Arc::clone(&self.pause),
            throttle: self.throttle.clone(),
            cancel: chunk_cancel.clone(),
            config: Arc::clone(&self.config),
            observer: Arc::new(ProgressTracker {
                package: Arc::clone(&self.package),
                bandwidth: Arc::clone(&self.bandwidth),
                events: self.events.clone(),
                limiter: Arc::clone(&limiter),
                parallel_count,
                live_streaming: self.config.live_streaming,
            }),
            ranged,
        };

        let mut tasks = JoinSet::new();
        for chunk in plan.chunks.into_iter().filter(|chunk| !chunk.is_complete()) {
            let request = run.requests[chunk.id as usize % run.requests.len()].clone();
            let limiter = Arc::clone(&limiter);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                // The slot is held for the whole chunk, paused time included.
                let _permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
                    permit = limiter.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(CoreError::Cancelled),
                    },
                };
                ChunkDownloader::new(chunk, request, ctx).download().await
            });
        }

        let mut first_error = None;
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(CoreError::InvalidState(format!("chunk task aborted: {}", err)))
            });
            match result {
                Ok(_) => {}
                Err(CoreError::Cancelled) => cancelled = true,
                Err(err) => {
                    if first_error.is_none() {
                        warn!(error = %err, "chunk failed, stopping remaining chunks");
                        chunk_cancel.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if cancelled || run.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if !self.lock_package()?.is_complete() {
            return Err(CoreError::InvalidState(
                "download ended with incomplete chunks".to_string(),
            ));
        }
        storage.flush().await
    }

    /// Swaps the run's limiter for a single slot so `active_chunks` reports
    /// the sequential transfer.
    fn narrow_to_single_slot(&self, run: &Run) -> CoreResult<(Arc<Semaphore>, usize)> {
        let limiter = Arc::new(Semaphore::new(1));
        if let Some(current) = self.lock_run()?.as_mut() {
            if Arc::ptr_eq(&current.phase, &run.phase) {
                current.limiter = Arc::clone(&limiter);
                current.parallel_count = 1;
            }
        }
        Ok((limiter, 1))
    }

    async fn finish(&self, run: &Run, completion: DownloadCompletion) {
        let mut release = None;
        let mut delete = None;
        match self.lock_package() {
            Ok(mut package) => {
                package.is_saving = false;
                match &completion {
                    DownloadCompletion::Success => {
                        package.status = DownloadStatus::Completed;
                        package.is_save_complete = true;
                        if !package.chunks.is_empty() {
                            package.recompute_received();
                        }
                        if package.received_bytes_size > package.total_file_size {
                            package.total_file_size = package.received_bytes_size;
                        }
                        package.save_progress = 100.0;
                        package.clear_chunks();
                    }
                    DownloadCompletion::Cancelled => package.status = DownloadStatus::Stopped,
                    DownloadCompletion::Failed(_) => {
                        package.status = DownloadStatus::Failed;
                        if self.config.clear_package_on_completion_with_failure {
                            package.clear_chunks();
                            package.received_bytes_size = 0;
                            package.save_progress = 0.0;
                            release = package.storage.take();
                            if !package.in_memory {
                                delete = package.file_name.clone();
                            }
                        }
                    }
                }
                // File handles are released; a later resume reopens the path.
                if release.is_none() && !package.in_memory {
                    release = package.storage.take();
                }
            }
            Err(err) => warn!(error = %err, "could not finalize package"),
        }

        if let Some(storage) = release {
            if let Err(err) = storage.flush().await {
                warn!(error = %err, "flushing storage failed");
            }
            if let Err(err) = storage.dispose().await {
                warn!(error = %err, "disposing storage failed");
            }
        }
        if let Some(path) = delete {
            if let Err(err) = remove_file_if_exists(&path).await {
                warn!(path = %path.display(), error = %err, "removing partial file failed");
            }
        }

        match &completion {
            DownloadCompletion::Success => info!("download completed"),
            DownloadCompletion::Cancelled => info!("download cancelled"),
            DownloadCompletion::Failed(err) => warn!(error = %err, "download failed"),
        }
        let _ = self.events.send(DownloadEvent::Completed(completion.clone()));
        run.phase.send_replace(RunPhase::Done(completion));
    }
}

/// Keeps the package in step with chunk progress and turns it into events.
struct ProgressTracker {
    package: Arc<Mutex<DownloadPackage>>,
    bandwidth: Arc<Bandwidth>,
    events: broadcast::Sender<DownloadEvent>,
    limiter: Arc<Semaphore>,
    parallel_count: usize,
    live_streaming: bool,
}

impl ProgressTracker {
    fn active_chunks(&self) -> usize {
        self.parallel_count
            .saturating_sub(self.limiter.available_permits())
    }
}

fn sync_chunk(package: &mut DownloadPackage, chunk: &Chunk) {
    if let Some(stored) = package.chunks.iter_mut().find(|stored| stored.id == chunk.id) {
        *stored = chunk.clone();
    }
}

impl ChunkObserver for ProgressTracker {
    fn on_progress(&self, chunk: &Chunk, data: &[u8]) {
        let progressed = data.len() as u64;
        let received_bytes = self.live_streaming.then(|| Bytes::copy_from_slice(data));
        self.bandwidth.calculate_speed(progressed);
        let Ok(mut package) = self.package.lock() else {
            return;
        };
        sync_chunk(&mut package, chunk);
        package.received_bytes_size += progressed;
        if package.received_bytes_size > package.total_file_size {
            package.total_file_size = package.received_bytes_size;
        }
        package.save_progress = package.progress_percentage();

        let speed = self.bandwidth.speed();
        let average = self.bandwidth.average_speed();
        let active_chunks = self.active_chunks();
        let chunk_info = ProgressInfo {
            chunk_id: Some(chunk.id),
            progress_percentage: chunk.progress_percentage(),
            total_bytes_to_receive: chunk.length().unwrap_or(0),
            received_bytes_size: chunk.received(),
            progressed_byte_size: progressed,
            bytes_per_second_speed: speed,
            average_bytes_per_second_speed: average,
            active_chunks,
            received_bytes: received_bytes.clone(),
        };
        let total_info = ProgressInfo {
            chunk_id: None,
            progress_percentage: package.save_progress,
            total_bytes_to_receive: package.total_file_size,
            received_bytes_size: package.received_bytes_size,
            progressed_byte_size: progressed,
            bytes_per_second_speed: speed,
            average_bytes_per_second_speed: average,
            active_chunks,
            received_bytes,
        };
        // Sent under the package lock so whole-file progress arrives in order.
        let _ = self.events.send(DownloadEvent::ChunkProgress(chunk_info));
        let _ = self.events.send(DownloadEvent::Progress(total_info));
    }

    fn on_status(&self, chunk: &Chunk) {
        if let Ok(mut package) = self.package.lock() {
            sync_chunk(&mut package, chunk);
        }
    }
}

async fn prepare_destination(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    remove_file_if_exists(path).await
}

async fn remove_file_if_exists(path: &Path) -> CoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
