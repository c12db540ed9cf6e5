use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tiny_http::{Response, Server};

use ibge_importer::app::{CancelToken, ProgressEvent, ProgressSink};
use ibge_importer::cache::{FileCache, MemoryCache, ResponseCache, cache_key};
use ibge_importer::error::ImportError;
use ibge_importer::fetch::{Downloader, HttpDownloader};
use ibge_importer::ibge::{GeographyApi, IbgeHttpClient};

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

/// Answers the next `responses.len()` requests in order, then stops.
fn serve(responses: Vec<(u16, Vec<u8>)>) -> (String, thread::JoinHandle<usize>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let handle = thread::spawn(move || {
        let mut served = 0;
        for (status, body) in responses {
            let Ok(request) = server.recv() else {
                break;
            };
            let _ = request.respond(Response::from_data(body).with_status_code(status));
            served += 1;
        }
        served
    });
    (format!("http://{addr}"), handle)
}

fn downloader() -> HttpDownloader {
    HttpDownloader::new(Duration::from_secs(2), 1024).unwrap()
}

#[test]
fn downloads_in_chunks_to_destination() {
    let body = vec![7u8; 3000];
    let (base, handle) = serve(vec![(200, body.clone())]);
    let temp = tempfile::tempdir().unwrap();
    let destination = temp.path().join("nested").join("Empresas0.zip");
    let sink = RecordingSink::default();

    let fetched = downloader()
        .fetch(&format!("{base}/Empresas0.zip"), &destination, &CancelToken::new(), &sink)
        .unwrap();
    handle.join().unwrap();

    assert!(!fetched.reused);
    assert_eq!(fetched.bytes, 3000);
    assert_eq!(fs::read(&destination).unwrap(), body);
    let messages = sink.messages.lock().unwrap();
    assert!(messages.iter().all(|message| message.starts_with("phase=Fetch; ")));
    assert!(messages.iter().any(|message| message.contains("3/3 chunks")));
}

#[test]
fn existing_file_is_reused_without_request() {
    let temp = tempfile::tempdir().unwrap();
    let destination = temp.path().join("Empresas0.zip");
    fs::write(&destination, b"previous download").unwrap();

    let fetched = downloader()
        .fetch(
            "http://127.0.0.1:9/Empresas0.zip",
            &destination,
            &CancelToken::new(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert!(fetched.reused);
    assert_eq!(fetched.bytes, 17);
    assert_eq!(fs::read(&destination).unwrap(), b"previous download");
}

#[test]
fn error_status_leaves_no_file() {
    let (base, handle) = serve(vec![(404, Vec::new())]);
    let temp = tempfile::tempdir().unwrap();
    let destination = temp.path().join("Empresas0.zip");

    let result = downloader().fetch(
        &format!("{base}/Empresas0.zip"),
        &destination,
        &CancelToken::new(),
        &RecordingSink::default(),
    );
    handle.join().unwrap();

    assert_matches!(result, Err(ImportError::Download { status: 404, .. }));
    assert!(!destination.exists());
}

#[test]
fn cancelled_download_leaves_no_file() {
    let (base, handle) = serve(vec![(200, vec![1u8; 4096])]);
    let temp = tempfile::tempdir().unwrap();
    let destination = temp.path().join("Empresas0.zip");
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = downloader().fetch(
        &format!("{base}/Empresas0.zip"),
        &destination,
        &cancel,
        &RecordingSink::default(),
    );
    handle.join().unwrap();

    assert_matches!(result, Err(ImportError::Cancelled));
    assert!(!destination.exists());
}

#[test]
fn api_responses_are_cached() {
    let (base, handle) = serve(vec![(200, br#"[{"id": 11, "nome": "Rondonia"}]"#.to_vec())]);
    let cache = Arc::new(MemoryCache::new());
    let client = IbgeHttpClient::new(
        &format!("{base}/api/v1/localidades/"),
        Duration::from_secs(2),
        cache.clone(),
        Duration::from_secs(60),
    )
    .unwrap();

    let first = client.estados().unwrap();
    assert_eq!(handle.join().unwrap(), 1);
    let second = client.estados().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn transient_failures_are_retried() {
    let (base, handle) = serve(vec![
        (503, Vec::new()),
        (200, br#"[{"id": 1100015, "nome": "Alta Floresta D'Oeste"}]"#.to_vec()),
    ]);
    let client = IbgeHttpClient::new(
        &base,
        Duration::from_secs(2),
        Arc::new(MemoryCache::new()),
        Duration::from_secs(60),
    )
    .unwrap();

    let records = client.municipios().unwrap();
    assert_eq!(handle.join().unwrap(), 2);
    assert_eq!(records.len(), 1);
}

#[test]
fn non_array_body_is_rejected() {
    let (base, handle) = serve(vec![(200, br#"{"message": "not found"}"#.to_vec())]);
    let cache = Arc::new(MemoryCache::new());
    let client = IbgeHttpClient::new(
        &base,
        Duration::from_secs(2),
        cache.clone(),
        Duration::from_secs(60),
    )
    .unwrap();

    assert_matches!(client.distritos(), Err(ImportError::Transport { .. }));
    handle.join().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn bypass_refetches_and_refreshes_file_cache() {
    let temp = tempfile::tempdir().unwrap();
    let cache_dir = camino::Utf8PathBuf::from_path_buf(temp.path().join("api")).unwrap();
    let cache: Arc<dyn ResponseCache> = Arc::new(FileCache::new(cache_dir));
    let ttl = Duration::from_secs(60);

    let (base, handle) = serve(vec![(200, br#"[{"id": 1}, {"id": 2}]"#.to_vec())]);
    let cached = IbgeHttpClient::new(&base, Duration::from_secs(2), cache.clone(), ttl).unwrap();
    cache
        .set(&cache_key(&cached.endpoint_url("estados")), &json!([{"id": 1}]), ttl)
        .unwrap();
    assert_eq!(cached.estados().unwrap().len(), 1);

    let forced = cached.clone().with_cache_bypass(true);
    assert_eq!(forced.estados().unwrap().len(), 2);
    assert_eq!(handle.join().unwrap(), 1);

    assert_eq!(cached.estados().unwrap().len(), 2);
}
