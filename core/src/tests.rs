use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

use crate::checksum::{verify_package, ChecksumRequest, ChecksumType};
use crate::chunk::ChunkStatus;
use crate::config::DownloadConfig;
use crate::error::CoreError;
use crate::events::{DownloadCompletion, DownloadEvent, ProgressInfo};
use crate::net::HttpMethod;
use crate::package::{DownloadPackage, DownloadStatus};
use crate::service::DownloadService;
use crate::testing::{sample_bytes, Failure, MockTransport};

const URL: &str = "http://localhost/dummyfile/16384";
const SIZE: usize = 16384;

fn config(chunk_count: u32, parallel_count: usize) -> DownloadConfig {
    DownloadConfig {
        chunk_count,
        parallel_count,
        buffer_block_size: 1024,
        retry_count: 2,
        retry_backoff_ms: 1,
        max_retry_backoff_ms: 10,
        timeout_ms: 5000,
        ..DownloadConfig::default()
    }
}

fn urls() -> Vec<String> {
    vec![URL.to_string()]
}

fn drain(rx: &mut Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

fn total_progress(events: &[DownloadEvent]) -> Vec<ProgressInfo> {
    events
        .iter()
        .filter_map(|event| match event {
            DownloadEvent::Progress(info) => Some(info.clone()),
            _ => None,
        })
        .collect()
}

fn completions(events: &[DownloadEvent]) -> Vec<DownloadCompletion> {
    events
        .iter()
        .filter_map(|event| match event {
            DownloadEvent::Completed(completion) => Some(completion.clone()),
            _ => None,
        })
        .collect()
}

async fn wait_for_received(rx: &mut Receiver<DownloadEvent>, at_least: u64) {
    loop {
        match rx.recv().await {
            Ok(DownloadEvent::Progress(info)) if info.received_bytes_size >= at_least => return,
            Ok(DownloadEvent::Completed(_)) | Err(RecvError::Closed) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
}

fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("downloaded file")
}

#[tokio::test]
async fn downloads_16kib_in_eight_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("file.bin");
    let transport = Arc::new(MockTransport::new(sample_bytes(SIZE)));
    let service = DownloadService::with_transport(config(8, 4), transport.clone());
    let mut rx = service.subscribe();

    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");

    assert_eq!(completion, DownloadCompletion::Success);
    assert_eq!(read_file(&path), sample_bytes(SIZE));

    let mut starts = transport.range_starts();
    starts.sort_unstable();
    assert_eq!(starts, (0..8).map(|index| index * 2048).collect::<Vec<u64>>());

    let package = service.package().expect("package");
    assert!(package.is_save_complete);
    assert!(package.chunks.is_empty());
    assert!(package.storage.is_none());
    assert_eq!(package.received_bytes_size, SIZE as u64);
    assert_eq!(package.total_file_size, SIZE as u64);
    assert_eq!(package.status, DownloadStatus::Completed);

    let events = drain(&mut rx);
    assert!(matches!(
        events.first(),
        Some(DownloadEvent::Started { total_bytes_to_receive, .. }) if *total_bytes_to_receive == SIZE as u64
    ));
    assert_eq!(completions(&events), vec![DownloadCompletion::Success]);
    let progress = total_progress(&events);
    assert_eq!(progress.last().map(|info| info.received_bytes_size), Some(SIZE as u64));
    assert!(progress.iter().all(|info| info.active_chunks <= 4));
}

#[tokio::test]
async fn aggregate_progress_never_decreases() {
    let transport = MockTransport::new(sample_bytes(SIZE)).with_packets(300, Duration::from_millis(1));
    let service = DownloadService::with_transport(config(8, 8), Arc::new(transport));
    let mut rx = service.subscribe();

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());

    let progress = total_progress(&drain(&mut rx));
    assert!(!progress.is_empty());
    assert!(progress.iter().all(|info| info.received_bytes.is_none()));
    for pair in progress.windows(2) {
        assert!(pair[1].received_bytes_size >= pair[0].received_bytes_size);
        assert!(pair[1].progress_percentage >= pair[0].progress_percentage);
    }
    let package = service.package().expect("package");
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(SIZE));
}

#[tokio::test]
async fn pause_and_resume_ten_times_from_progress_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("paused.bin");
    let transport = Arc::new(
        MockTransport::new(sample_bytes(SIZE)).with_packets(128, Duration::from_millis(2)),
    );
    let service = Arc::new(DownloadService::with_transport(config(8, 4), transport.clone()));

    let watcher = {
        let service = Arc::clone(&service);
        let mut rx = service.subscribe();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match rx.recv().await {
                    Ok(DownloadEvent::Progress(_)) if held.len() < 10 => {
                        service.pause();
                        // Chunks finish the packet in hand, then park.
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        let parked = service.package().expect("package");
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let later = service.package().expect("package");
                        held.push((
                            parked.status,
                            parked.received_bytes_size,
                            later.received_bytes_size,
                        ));
                        service.resume();
                    }
                    Ok(DownloadEvent::Completed(_)) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
            held
        })
    };

    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");
    let held = watcher.await.expect("watcher");

    assert!(completion.is_success());
    assert_eq!(held.len(), 10);
    for (status, parked, later) in &held {
        assert_eq!(*status, DownloadStatus::Paused);
        assert_eq!(parked, later, "bytes arrived while paused");
        assert!(*parked < SIZE as u64);
    }
    // Pausing never reopens a range, so every chunk was requested once.
    let mut starts = transport.range_starts();
    starts.sort_unstable();
    assert_eq!(starts, (0..8).map(|index| index * 2048).collect::<Vec<u64>>());
    assert!(service.package().expect("package").is_save_complete);
    assert_eq!(read_file(&path), sample_bytes(SIZE));
}

#[tokio::test]
async fn failing_chunk_clears_package_and_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.bin");
    let transport = Arc::new(
        MockTransport::new(sample_bytes(SIZE))
            .with_packets(256, Duration::from_millis(200))
            .fail_range(4096, Failure::Status(500), None),
    );
    let mut cfg = config(8, 8);
    cfg.clear_package_on_completion_with_failure = true;
    let service = DownloadService::with_transport(cfg, transport.clone());
    let mut rx = service.subscribe();

    let started = Instant::now();
    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");

    // Siblings need 8 packets of 200ms each; they must have been cancelled.
    assert!(started.elapsed() < Duration::from_secs(1));
    match completion.error() {
        Some(CoreError::HttpStatus { status, .. }) => assert_eq!(*status, 500),
        other => panic!("unexpected outcome {:?}", other),
    }
    // One attempt plus two retries.
    assert_eq!(
        transport.range_starts().iter().filter(|start| **start == 4096).count(),
        3
    );

    let package = service.package().expect("package");
    assert!(package.chunks.is_empty());
    assert!(package.storage.is_none());
    assert_eq!(package.received_bytes_size, 0);
    assert_eq!(package.status, DownloadStatus::Failed);
    assert!(!path.exists());
    assert_eq!(completions(&drain(&mut rx)).len(), 1);
}

#[tokio::test]
async fn failing_chunk_keeps_partial_state_without_clear_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("partial.bin");
    let transport = MockTransport::new(sample_bytes(SIZE))
        .with_packets(256, Duration::from_millis(50))
        .fail_range(4096, Failure::Status(404), None);
    let service = DownloadService::with_transport(config(8, 8), Arc::new(transport));

    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");

    assert!(matches!(
        completion,
        DownloadCompletion::Failed(CoreError::HttpStatus { status: 404, .. })
    ));
    let package = service.package().expect("package");
    assert_eq!(package.chunks.len(), 8);
    assert_eq!(package.chunks[2].status, ChunkStatus::Failed);
    assert_eq!(package.chunks[2].retry_count, 0);
    assert!(package.chunks.iter().filter(|chunk| chunk.is_complete()).count() < 7);
    assert!(path.exists());
}

#[tokio::test]
async fn cancel_while_paused_completes_promptly() {
    let transport = MockTransport::new(sample_bytes(SIZE)).with_packets(256, Duration::from_millis(10));
    let service = Arc::new(DownloadService::with_transport(config(4, 4), Arc::new(transport)));
    let mut rx = service.subscribe();

    let runner = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.download(urls(), None).await })
    };
    wait_for_received(&mut rx, 1).await;

    service.pause();
    assert_eq!(service.status(), DownloadStatus::Paused);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let held = service.package().expect("package").received_bytes_size;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(service.package().expect("package").received_bytes_size, held);
    assert!(held < SIZE as u64);

    service.cancel();
    let completion = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("cancel must not hang")
        .expect("join")
        .expect("download");

    assert!(completion.is_cancelled());
    assert!(service.is_cancelled());
    assert!(!service.is_paused());
    assert_eq!(service.status(), DownloadStatus::Stopped);
}

#[tokio::test]
async fn serialized_file_package_resumes_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("resume.bin");
    let first = MockTransport::new(sample_bytes(SIZE)).with_packets(256, Duration::from_millis(5));
    let service = Arc::new(DownloadService::with_transport(config(8, 4), Arc::new(first)));

    let watcher = {
        let service = Arc::clone(&service);
        let mut rx = service.subscribe();
        tokio::spawn(async move {
            wait_for_received(&mut rx, 4096).await;
            service.cancel_and_wait().await;
        })
    };
    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");
    watcher.await.expect("watcher");
    assert!(completion.is_cancelled());

    let json = service.package().expect("package").to_json().expect("json");
    let restored = DownloadPackage::from_json(&json).expect("restore");
    assert_eq!(restored.status, DownloadStatus::Stopped);
    let partial: Vec<_> = restored
        .chunks
        .iter()
        .filter(|chunk| chunk.position > chunk.start && !chunk.is_complete())
        .cloned()
        .collect();
    assert!(!partial.is_empty());

    let second = Arc::new(MockTransport::new(sample_bytes(SIZE)));
    let resumed = DownloadService::with_transport(config(8, 4), second.clone());
    let completion = resumed
        .download_package(restored.clone(), None)
        .await
        .expect("resume");

    assert!(completion.is_success());
    assert_eq!(read_file(&path), sample_bytes(SIZE));
    let starts = second.range_starts();
    for chunk in &partial {
        assert!(starts.contains(&chunk.position));
        assert!(!starts.contains(&chunk.start));
    }
    for chunk in restored.chunks.iter().filter(|chunk| chunk.is_complete()) {
        assert!(!starts.contains(&chunk.start));
    }
    assert_eq!(resumed.package().expect("package").id, restored.id);
}

#[tokio::test]
async fn serialized_memory_package_carries_its_bytes() {
    let first = MockTransport::new(sample_bytes(SIZE)).with_packets(256, Duration::from_millis(5));
    let service = Arc::new(DownloadService::with_transport(config(4, 4), Arc::new(first)));

    let watcher = {
        let service = Arc::clone(&service);
        let mut rx = service.subscribe();
        tokio::spawn(async move {
            wait_for_received(&mut rx, 2048).await;
            service.cancel();
        })
    };
    let completion = service.download(urls(), None).await.expect("download");
    watcher.await.expect("watcher");
    assert!(completion.is_cancelled());

    let json = service.package().expect("package").to_json().expect("json");
    let restored = DownloadPackage::from_json(&json).expect("restore");
    assert!(restored.in_memory);
    assert!(restored.storage.is_some());

    let resumed = DownloadService::with_transport(
        config(4, 4),
        Arc::new(MockTransport::new(sample_bytes(SIZE))),
    );
    let completion = resumed.download_package(restored, None).await.expect("resume");
    assert!(completion.is_success());
    let package = resumed.package().expect("package");
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(SIZE));
}

#[tokio::test]
async fn server_without_ranges_gets_one_chunk() {
    let transport = Arc::new(MockTransport::new(sample_bytes(SIZE)).without_ranges());
    let service = DownloadService::with_transport(config(8, 4), transport.clone());
    let mut rx = service.subscribe();

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());

    let plain_gets = transport
        .requests()
        .iter()
        .filter(|req| req.method == HttpMethod::Get && req.range.is_none())
        .count();
    assert_eq!(plain_gets, 1);
    let events = drain(&mut rx);
    assert!(events.iter().all(|event| match event {
        DownloadEvent::ChunkProgress(info) => info.chunk_id == Some(0) && info.active_chunks <= 1,
        _ => true,
    }));
    let package = service.package().expect("package");
    assert!(!package.is_support_download_in_range);
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(SIZE));
}

#[tokio::test]
async fn unknown_size_download_runs_until_the_body_ends() {
    let transport = MockTransport::new(sample_bytes(5000)).without_ranges().without_length();
    let service = DownloadService::with_transport(config(8, 4), Arc::new(transport));

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());
    let package = service.package().expect("package");
    assert_eq!(package.received_bytes_size, 5000);
    assert_eq!(package.total_file_size, 5000);
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(5000));
}

#[tokio::test]
async fn dropped_connection_without_ranges_skips_received_bytes() {
    let transport = MockTransport::new(sample_bytes(SIZE))
        .with_packets(1000, Duration::ZERO)
        .without_ranges()
        // The first hit is the one-byte probe, the second the transfer itself.
        .fail_range(0, Failure::CutAfter(5000), Some(2));
    let service = DownloadService::with_transport(config(1, 1), Arc::new(transport));
    let mut rx = service.subscribe();

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());

    let progress = total_progress(&drain(&mut rx));
    for pair in progress.windows(2) {
        assert!(pair[1].received_bytes_size > pair[0].received_bytes_size);
    }
    let package = service.package().expect("package");
    assert_eq!(package.received_bytes_size, SIZE as u64);
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(SIZE));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let transport = Arc::new(
        MockTransport::new(sample_bytes(SIZE))
            .fail_range(8192, Failure::Network, Some(1))
            .fail_range(2048, Failure::Status(503), Some(2))
            .fail_range(6144, Failure::CutAfter(100), Some(1)),
    );
    let service = DownloadService::with_transport(config(8, 4), transport.clone());

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());
    let starts = transport.range_starts();
    assert_eq!(starts.iter().filter(|start| **start == 2048).count(), 3);
    assert!(starts.contains(&6244));
    let package = service.package().expect("package");
    assert_eq!(package.read_all().await.expect("bytes"), sample_bytes(SIZE));
}

#[tokio::test]
async fn chunks_round_robin_over_mirrors() {
    let transport = Arc::new(MockTransport::new(sample_bytes(SIZE)));
    let service = DownloadService::with_transport(config(4, 4), transport.clone());
    let mirrors = vec![
        "http://mirror-a/file.bin".to_string(),
        "http://mirror-b/file.bin".to_string(),
    ];

    let completion = service.download(mirrors.clone(), None).await.expect("download");
    assert!(completion.is_success());
    for mirror in &mirrors {
        let hits = transport
            .requests()
            .iter()
            .filter(|req| req.method == HttpMethod::Get && &req.url == mirror)
            .count();
        assert_eq!(hits, 2);
    }
}

#[tokio::test]
async fn completed_download_passes_checksum() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("sum.bin");
    let service = DownloadService::with_transport(
        config(4, 2),
        Arc::new(MockTransport::new(b"hello".to_vec())),
    );

    let completion = service
        .download_to_file(urls(), &path, None)
        .await
        .expect("download");
    assert!(completion.is_success());

    let package = service.package().expect("package");
    let req = ChecksumRequest {
        checksum_type: ChecksumType::Sha256,
        expected_hex: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".to_string(),
    };
    verify_package(&package, &req).await.expect("checksum");
}

#[tokio::test]
async fn caller_token_cancels_the_download() {
    let transport = MockTransport::new(sample_bytes(SIZE)).with_packets(256, Duration::from_millis(10));
    let service = Arc::new(DownloadService::with_transport(config(4, 4), Arc::new(transport)));
    let token = tokio_util::sync::CancellationToken::new();
    let mut rx = service.subscribe();

    let runner = {
        let service = Arc::clone(&service);
        let token = token.clone();
        tokio::spawn(async move { service.download(urls(), Some(token)).await })
    };
    wait_for_received(&mut rx, 1).await;
    token.cancel();

    let completion = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("no hang")
        .expect("join")
        .expect("download");
    assert!(completion.is_cancelled());
    assert_eq!(service.status(), DownloadStatus::Stopped);
}

#[tokio::test]
async fn clear_keeps_package_and_dispose_drops_it() {
    let service = DownloadService::with_transport(
        config(4, 4),
        Arc::new(MockTransport::new(sample_bytes(4096))),
    );
    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());
    let id = service.package().expect("package").id;

    service.clear().await;
    service.clear().await;
    let package = service.package().expect("package");
    assert_eq!(package.id, id);
    assert!(package.storage.is_some());

    service.dispose().await.expect("dispose");
    let package = service.package().expect("package");
    assert_ne!(package.id, id);
    assert!(package.storage.is_none());
    assert_eq!(package.status, DownloadStatus::None);
}

#[tokio::test]
async fn live_bandwidth_limit_is_applied() {
    let mut cfg = config(1, 1);
    cfg.max_bytes_per_second = 1;
    let service = DownloadService::with_transport(cfg, Arc::new(MockTransport::new(sample_bytes(SIZE))));
    assert_eq!(service.max_bytes_per_second(), 1);
    service.set_max_bytes_per_second(0);
    assert_eq!(service.max_bytes_per_second(), 0);

    let completion = tokio::time::timeout(Duration::from_secs(2), service.download(urls(), None))
        .await
        .expect("unthrottled download finishes")
        .expect("download");
    assert!(completion.is_success());
}

#[tokio::test]
async fn start_without_initialize_fails() {
    let service = DownloadService::with_transport(
        DownloadConfig::default(),
        Arc::new(MockTransport::new(Vec::new())),
    );
    assert!(matches!(
        service.start().await,
        DownloadCompletion::Failed(CoreError::InvalidState(_))
    ));
    assert!(matches!(
        service.download(Vec::new(), None).await,
        Err(CoreError::InvalidState(_))
    ));
}

#[tokio::test]
async fn live_streaming_attaches_written_bytes_to_progress() {
    let mut cfg = config(4, 4);
    cfg.live_streaming = true;
    let service = DownloadService::with_transport(cfg, Arc::new(MockTransport::new(sample_bytes(SIZE))));
    let mut rx = service.subscribe();

    let completion = service.download(urls(), None).await.expect("download");
    assert!(completion.is_success());

    let mut per_chunk: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut streamed = 0;
    for event in drain(&mut rx) {
        match event {
            DownloadEvent::ChunkProgress(info) => {
                let bytes = info.received_bytes.expect("chunk bytes");
                assert_eq!(bytes.len() as u64, info.progressed_byte_size);
                per_chunk
                    .entry(info.chunk_id.expect("chunk id"))
                    .or_default()
                    .extend_from_slice(&bytes);
            }
            DownloadEvent::Progress(info) => {
                streamed += info.received_bytes.expect("file bytes").len();
            }
            _ => {}
        }
    }
    let joined: Vec<u8> = per_chunk.into_values().flatten().collect();
    assert_eq!(joined, sample_bytes(SIZE));
    assert_eq!(streamed, SIZE);
}

#[tokio::test]
async fn oversized_memory_download_fails_without_allocating() {
    let transport = MockTransport::new(sample_bytes(SIZE)).claiming_length(u64::MAX / 2);
    let service = DownloadService::with_transport(config(8, 4), Arc::new(transport));
    let mut rx = service.subscribe();

    let completion = service.download(urls(), None).await.expect("download");

    assert!(matches!(completion, DownloadCompletion::Failed(CoreError::Storage(_))));
    assert_eq!(service.package().expect("package").status, DownloadStatus::Failed);
    assert_eq!(completions(&drain(&mut rx)).len(), 1);
}

#[tokio::test]
async fn stalled_name_lookup_honours_the_caller_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = MockTransport::new(sample_bytes(SIZE)).stall_head(URL);
    let service = DownloadService::with_transport(config(4, 4), Arc::new(transport));
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        service.download_to_dir(urls(), dir.path(), Some(cancel)),
    )
    .await
    .expect("lookup stopped");
    trigger.await.expect("trigger");

    assert_eq!(result, Err(CoreError::Cancelled));
}

#[tokio::test]
async fn stalled_first_mirror_falls_back_for_the_file_name() {
    const STALLED: &str = "http://stalled.invalid/dummyfile/16384";
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = MockTransport::new(sample_bytes(SIZE))
        .with_file_name("report.pdf")
        .stall_head(STALLED);
    let mut cfg = config(4, 4);
    cfg.timeout_ms = 100;
    let service = DownloadService::with_transport(cfg, Arc::new(transport));

    let completion = tokio::time::timeout(
        Duration::from_secs(3),
        service.download_to_dir(vec![STALLED.to_string(), URL.to_string()], dir.path(), None),
    )
    .await
    .expect("download finished")
    .expect("download");

    assert!(completion.is_success());
    assert_eq!(read_file(&dir.path().join("report.pdf")), sample_bytes(SIZE));
}
