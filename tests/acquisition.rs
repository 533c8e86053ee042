use std::io::Write;
use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use futures_util::StreamExt;

use reader_tts::models::{DownloadProgress, ModelDownloadManager, ModelFamily, ModelInfo, ModelStatus};

fn bz2(tar_bytes: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn voice_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in [
        ("vits-test/model.onnx", &b"not really onnx"[..]),
        ("vits-test/tokens.txt", &b"_ 0\na 1\n"[..]),
        ("vits-test/espeak-ng-data/phontab", &b"data"[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, body).unwrap();
    }
    bz2(&builder.into_inner().unwrap())
}

fn traversal_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let ok = b"fine";
    let mut header = tar::Header::new_gnu();
    header.set_size(ok.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "vits-test/tokens.txt", &ok[..]).unwrap();

    let body = b"pwned";
    let mut header = tar::Header::new_old();
    let name = b"../../escaped.txt";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, &body[..]).unwrap();

    bz2(&builder.into_inner().unwrap())
}

/// A voice whose weights do not compress, so extraction takes a while.
fn large_voice_archive(weights_len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let weights: Vec<u8> = (0..weights_len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect();

    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in [
        ("vits-test/tokens.txt", &b"_ 0\na 1\n"[..]),
        ("vits-test/model.onnx", &weights[..]),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, body).unwrap();
    }
    bz2(&builder.into_inner().unwrap())
}

async fn serve_one(archive: Vec<u8>) -> String {
    let router = Router::new().route("/voice.tar.bz2", get(move || async move { archive }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/voice.tar.bz2")
}

async fn serve() -> String {
    let good = voice_archive();
    let evil = traversal_archive();
    let router = Router::new()
        .route("/good.tar.bz2", get(move || async move { good }))
        .route("/evil.tar.bz2", get(move || async move { evil }))
        .route("/empty.tar.bz2", get(|| async { Vec::<u8>::new() }))
        .route("/gone.tar.bz2", get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_model(id: &'static str, url: String) -> ModelInfo {
    ModelInfo {
        id,
        display_name: "Test voice",
        family: ModelFamily::Piper,
        languages: &["en"],
        download_url: Box::leak(url.into_boxed_str()),
        size_bytes: 1_000,
        num_speakers: 1,
        model_file: "model.onnx",
        tokens_file: "tokens.txt",
        archive_dir: "vits-test",
        description: "fixture",
        sha256: None,
    }
}

fn manager(root: &Path) -> ModelDownloadManager {
    ModelDownloadManager::with_client(
        reqwest::Client::new(),
        root.join("models"),
        root.join("cache"),
        Duration::from_secs(5),
    )
}

async fn run(mgr: &ModelDownloadManager, model: &ModelInfo) -> Vec<DownloadProgress> {
    mgr.acquire(model).collect().await
}

fn no_leftovers(root: &Path) {
    let cache = root.join("cache");
    if cache.exists() {
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0, "partial download left behind");
    }
    let models = root.join("models");
    if models.exists() {
        for entry in std::fs::read_dir(&models).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().starts_with(".staging"), "staging dir left behind");
        }
    }
}

#[tokio::test]
async fn installs_removes_and_reports_status() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-good", format!("{base}/good.tar.bz2"));

    assert_eq!(mgr.status(model.id), ModelStatus::NotDownloaded);
    let events = run(&mgr, &model).await;

    let last = events.last().unwrap();
    assert!(last.complete, "unexpected final event {last:?}");
    assert!(last.error.is_none());
    assert!(events.iter().any(|e| e.extracting));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let downloading: Vec<u64> = events
        .iter()
        .filter(|e| !e.extracting && !e.complete)
        .map(|e| e.bytes_downloaded)
        .collect();
    assert!(downloading.windows(2).all(|w| w[0] <= w[1]), "progress went backwards");

    let dir = mgr.model_dir(model.id);
    assert!(mgr.is_ready(model.id));
    assert!(dir.join("tokens.txt").is_file());
    assert!(dir.join("espeak-ng-data/phontab").is_file());
    assert_eq!(mgr.status(model.id), ModelStatus::Downloaded);
    assert!(mgr.list_ready().contains("test-good"));
    no_leftovers(scratch.path());

    assert!(mgr.remove(model.id));
    assert!(!mgr.is_ready(model.id));
    assert!(!mgr.remove(model.id));
}

#[tokio::test]
async fn http_error_yields_one_terminal_error() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-gone", format!("{base}/gone.tar.bz2"));

    let events = run(&mgr, &model).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error.as_deref(), Some("HTTP 404"));
    assert!(!events[0].complete);
    assert!(!mgr.is_ready(model.id));
    assert!(!mgr.model_dir(model.id).exists());
    no_leftovers(scratch.path());
}

#[tokio::test]
async fn empty_body_is_an_error() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-empty", format!("{base}/empty.tar.bz2"));

    let events = run(&mgr, &model).await;
    let last = events.last().unwrap();
    assert_eq!(last.error.as_deref(), Some("Empty response"));
    assert!(!mgr.is_ready(model.id));
    no_leftovers(scratch.path());
}

#[tokio::test]
async fn traversal_archive_installs_nothing() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-evil", format!("{base}/evil.tar.bz2"));

    let events = run(&mgr, &model).await;
    let last = events.last().unwrap();
    let error = last.error.as_deref().expect("traversal must fail");
    assert!(error.contains("escapes"), "unexpected error {error}");
    assert!(!mgr.is_ready(model.id));
    assert!(!mgr.model_dir(model.id).exists());
    assert!(!scratch.path().join("escaped.txt").exists());
    assert!(!scratch.path().join("models/escaped.txt").exists());
    no_leftovers(scratch.path());
}

#[tokio::test]
async fn unreachable_host_is_an_error() {
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let model = test_model("test-offline", format!("http://{addr}/voice.tar.bz2"));

    let events = run(&mgr, &model).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());
    assert!(!mgr.is_ready(model.id));
}

#[tokio::test]
async fn concurrent_acquire_of_same_id_is_rejected() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-twice", format!("{base}/good.tar.bz2"));

    let mut first = Box::pin(mgr.acquire(&model));
    let first_event = first.next().await.unwrap();
    assert!(first_event.error.is_none());

    let second = run(&mgr, &model).await;
    assert_eq!(second.len(), 1);
    assert!(second[0].error.as_deref().unwrap().contains("already in progress"));

    let rest: Vec<_> = first.collect().await;
    assert!(rest.last().unwrap().complete);
    assert!(mgr.is_ready(model.id));
}

#[tokio::test]
async fn dropping_the_stream_cancels_cleanly() {
    let base = serve().await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-cancel", format!("{base}/good.tar.bz2"));

    {
        let mut stream = Box::pin(mgr.acquire(&model));
        let _ = stream.next().await;
    }
    assert!(!mgr.is_ready(model.id));
    no_leftovers(scratch.path());

    // The claim was released, so a retry proceeds.
    let events = run(&mgr, &model).await;
    assert!(events.last().unwrap().complete);
}

#[tokio::test]
async fn retry_after_dropping_during_extraction_installs() {
    const WEIGHTS_LEN: usize = 8 * 1024 * 1024;
    let url = serve_one(large_voice_archive(WEIGHTS_LEN)).await;
    let scratch = tempfile::tempdir().unwrap();
    let mgr = manager(scratch.path());
    let model = test_model("test-retry", url);

    {
        let mut stream = Box::pin(mgr.acquire(&model));
        while let Some(event) = stream.next().await {
            assert!(!event.is_terminal(), "finished before extraction: {event:?}");
            if event.extracting {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The abandoned attempt keeps the id until its extraction ends.
    let retried = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let events = run(&mgr, &model).await;
            match events.last().and_then(|e| e.error.as_deref()) {
                Some(error) if error.contains("already in progress") => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                _ => return events,
            }
        }
    })
    .await
    .expect("retry never got the id");

    let last = retried.last().unwrap();
    assert!(last.complete, "retry failed: {last:?}");
    assert!(mgr.is_ready(model.id));
    let weights = std::fs::metadata(mgr.model_dir(model.id).join("model.onnx")).unwrap();
    assert_eq!(weights.len(), WEIGHTS_LEN as u64);
    no_leftovers(scratch.path());
}
