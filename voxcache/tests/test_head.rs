use voxcache::head::{HeadFileClient, HeadFileError};
use voxid::FileId;

fn file_id() -> FileId {
    FileId::from_base16("00112233445566778899aabbccddeeff00112233").unwrap()
}

#[tokio::test]
async fn fetch_head_returns_the_blob() {
    let mut server = mockito::Server::new_async().await;
    let id = file_id();
    let mock = server
        .mock("GET", format!("/head/{}", id.to_base16()).as_str())
        .with_status(200)
        .with_body([0x4F, 0x67, 0x67, 0x53])
        .create_async()
        .await;

    let client = HeadFileClient::new(server.url());
    let body = client.fetch_head(&id).await.unwrap();
    assert_eq!(body.as_ref(), &[0x4F, 0x67, 0x67, 0x53]);
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_head_classifies_as_http_error() {
    let mut server = mockito::Server::new_async().await;
    let id = file_id();
    server
        .mock("GET", format!("/head/{}", id.to_base16()).as_str())
        .with_status(404)
        .create_async()
        .await;

    let client = HeadFileClient::new(server.url());
    match client.fetch_head(&id).await.unwrap_err() {
        HeadFileError::HttpError { file_id, status } => {
            assert_eq!(file_id, id);
            assert_eq!(status, 404);
        }
        other => panic!("expected HttpError, got {other:?}"),
    }

    // The non-throwing variant swallows the failure.
    assert!(client.try_fetch_head(&id).await.is_none());
}

#[tokio::test]
async fn unreachable_host_classifies_as_network_error() {
    // Nothing listens on this port.
    let client = HeadFileClient::new("http://127.0.0.1:9");
    match client.fetch_head(&file_id()).await.unwrap_err() {
        HeadFileError::NetworkError { file_id: id, .. } => assert_eq!(id, file_id()),
        other => panic!("expected NetworkError, got {other:?}"),
    }
}
