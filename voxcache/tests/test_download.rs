use std::{
    io::{Read, Seek, SeekFrom},
    sync::Arc,
    time::Duration,
};

use voxcache::{
    download::{ChunkedDownloader, DownloadConfig},
    store::{AudioFileStore, StoreConfig},
};
use voxid::FileId;

fn body() -> Vec<u8> {
    (0..100u32).map(|i| (i * 3 + 1) as u8).collect()
}

fn small_config() -> DownloadConfig {
    DownloadConfig {
        chunk_size: 16,
        prefetch_window: 64,
        max_parallel: 4,
        request_timeout: Duration::from_secs(5),
        max_retries: 1,
    }
}

fn file_id() -> FileId {
    FileId::from_base16("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap()
}

async fn mock_ranges(server: &mut mockito::Server) {
    let data = body();
    let total = data.len();
    server
        .mock("GET", "/audio")
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", format!("bytes 0-0/{total}").as_str())
        .with_body(&data[0..1])
        .create_async()
        .await;

    // The downloader only ever asks for chunk-aligned windows; cover all
    // of them.
    let mut start = 0usize;
    while start < total {
        let mut end_align = start + 16;
        loop {
            let end = end_align.min(total);
            server
                .mock("GET", "/audio")
                .match_header("range", format!("bytes={}-{}", start, end - 1).as_str())
                .with_status(206)
                .with_header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, end - 1, total).as_str(),
                )
                .with_body(&data[start..end])
                .create_async()
                .await;
            if end == total {
                break;
            }
            end_align += 16;
        }
        start += 16;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progressive_read_sees_the_whole_file() {
    let mut server = mockito::Server::new_async().await;
    mock_ranges(&mut server).await;

    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(AudioFileStore::new(StoreConfig::new(dir.path())).unwrap());
    let downloader = ChunkedDownloader::new(store.clone(), small_config());

    let download = downloader
        .open(file_id(), format!("{}/audio", server.url()))
        .await
        .unwrap();
    assert_eq!(download.total_size(), 100);

    let mut stream = download.stream();
    let read = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).map(|_| out)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(read, body());
    assert!(download.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_and_read_waits_for_the_right_range() {
    let mut server = mockito::Server::new_async().await;
    mock_ranges(&mut server).await;

    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(AudioFileStore::new(StoreConfig::new(dir.path())).unwrap());
    let downloader = ChunkedDownloader::new(store.clone(), small_config());

    let download = downloader
        .open(file_id(), format!("{}/audio", server.url()))
        .await
        .unwrap();
    download.prefetch_for_seek(80);

    let mut stream = download.stream();
    let tail = tokio::task::spawn_blocking(move || {
        stream.seek(SeekFrom::Start(80)).unwrap();
        let mut out = vec![0u8; 20];
        stream.read_exact(&mut out).map(|_| out)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(tail, body()[80..100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_file_fails_the_reader() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/audio")
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", "bytes 0-0/100")
        .with_body([0u8])
        .create_async()
        .await;
    // The first real ranged fetch answers 404.
    server
        .mock("GET", "/audio")
        .match_header("range", "bytes=0-63")
        .with_status(404)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(AudioFileStore::new(StoreConfig::new(dir.path())).unwrap());
    let downloader = ChunkedDownloader::new(store, small_config());

    let download = downloader
        .open(file_id(), format!("{}/audio", server.url()))
        .await
        .unwrap();

    let mut stream = download.stream();
    let err = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).map(|_| out)
    })
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.to_string().contains("not found"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reopening_adopts_journaled_chunks() {
    let mut server = mockito::Server::new_async().await;
    mock_ranges(&mut server).await;

    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(AudioFileStore::new(StoreConfig::new(dir.path())).unwrap());

    {
        let downloader = ChunkedDownloader::new(store.clone(), small_config());
        let download = downloader
            .open(file_id(), format!("{}/audio", server.url()))
            .await
            .unwrap();
        let mut stream = download.stream();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).unwrap();
        })
        .await
        .unwrap();
        download.shutdown();
    }

    // A fresh downloader over the same store needs no further fetches for
    // data that is already journaled.
    let quiet = mockito::Server::new_async().await;
    let downloader = ChunkedDownloader::new(store, small_config());
    let download = downloader
        .open(file_id(), format!("{}/audio", quiet.url()))
        .await
        .unwrap();
    assert!(download.is_complete());

    let mut stream = download.stream();
    let read = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).map(|_| out)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(read, body());
}
