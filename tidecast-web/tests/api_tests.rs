//! Router tests driving the HTTP API with mock pipeline collaborators.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tidecast_core::PipelineOrchestrator;
use tidecast_core::config::TidecastConfig;
use tidecast_core::test_mocks::{
    MockController, MockDiscovery, MockFile, MockTranscoder, MockTransferBackend, mock_receiver,
};
use tidecast_web::{AppState, router};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Bao
const ENCODED_MAGNET: &str =
    "magnet%3A%3Fxt%3Durn%3Abtih%3A0123456789abcdef0123456789abcdef01234567%26dn%3DBao";

struct ApiFixture {
    _root: tempfile::TempDir,
    config: TidecastConfig,
    discovery: Arc<MockDiscovery>,
    controller: Arc<MockController>,
    app: Router,
}

impl ApiFixture {
    fn new(backend: MockTransferBackend) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = TidecastConfig::for_testing().with_storage_root(root.path());
        std::fs::create_dir_all(&config.library.directory).unwrap();

        let discovery = Arc::new(MockDiscovery::new(vec![mock_receiver("TV", "10.0.0.6")]));
        let controller = Arc::new(MockController::new());
        let pipeline = PipelineOrchestrator::new(
            &config,
            Arc::new(backend),
            Arc::new(MockTranscoder::new()),
            discovery.clone(),
            controller.clone(),
        );
        let app = router(AppState::new(pipeline, CancellationToken::new()));

        Self {
            _root: root,
            config,
            discovery,
            controller,
            app,
        }
    }

    fn add_library_file(&self, name: &str, len: usize) {
        std::fs::write(self.config.library.directory.join(name), vec![0u8; len]).unwrap();
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = self
            .app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get(uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }
}

#[tokio::test]
async fn test_library_lists_megabyte_sizes() {
    let fixture = ApiFixture::new(MockTransferBackend::new());
    fixture.add_library_file("a.mp4", 1_000_000);
    fixture.add_library_file("b.mkv", 2_500_000);

    let (status, body) = fixture.get_json("/library").await;

    assert_eq!(status, StatusCode::OK);
    let mut entries: Vec<(String, String)> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["name"].as_str().unwrap().to_string(),
                e["size"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("a.mp4".to_string(), "1.00mb".to_string()),
            ("b.mkv".to_string(), "2.50mb".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_play_without_file_name_dispatches_nothing() {
    let fixture = ApiFixture::new(MockTransferBackend::new());

    for uri in ["/play", "/play?fileName="] {
        let (status, body) = fixture.get(uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"no file name");
    }
    assert_eq!(fixture.discovery.subscriptions(), 0);
    assert!(fixture.controller.plays().is_empty());
}

#[tokio::test]
async fn test_play_existing_file() {
    let fixture = ApiFixture::new(MockTransferBackend::new());
    fixture.add_library_file("Bao 2018.mp4", 10);

    let (status, body) = fixture.get_json("/play?fileName=Bao%202018.mp4").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dispatching");
    assert_eq!(body["file"], "Bao 2018.mp4");
    assert_eq!(body["url"], "http://127.0.0.1:8008/videos/Bao%202018.mp4");
}

#[tokio::test]
async fn test_play_missing_file_is_not_found() {
    let fixture = ApiFixture::new(MockTransferBackend::new());

    let (status, body) = fixture.get_json("/play?fileName=ghost.mp4").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "invalid_request");
    assert!(fixture.controller.plays().is_empty());
}

#[tokio::test]
async fn test_torrent_without_link() {
    let fixture = ApiFixture::new(MockTransferBackend::new());

    let (status, body) = fixture.get("/torrent").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"magnetLink is required");
}

#[tokio::test]
async fn test_torrent_resolves_file() {
    let fixture = ApiFixture::new(
        MockTransferBackend::new()
            .with_files(vec![MockFile::new("Bao (2018)/Bao.2018.mp4", vec![0u8; 1_000_000])]),
    );

    let (status, body) = fixture
        .get_json(&format!("/torrent?magnetLink={ENCODED_MAGNET}"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Bao.2018.mp4");
    assert_eq!(body["size"], "1.00mb");
    assert_eq!(body["bytes"], 1_000_000);
    assert!(fixture.config.library.directory.join("Bao.2018.mp4").exists());
}

#[tokio::test]
async fn test_torrent_without_video_is_unprocessable() {
    let fixture = ApiFixture::new(
        MockTransferBackend::new().with_files(vec![MockFile::new("notes.txt", "hello")]),
    );

    let (status, body) = fixture
        .get_json(&format!("/torrent?magnetLink={ENCODED_MAGNET}"))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "no_playable_file");
}

#[tokio::test]
async fn test_failed_transfer_is_bad_gateway() {
    let fixture = ApiFixture::new(MockTransferBackend::aborting("no peers"));

    let (status, _) = fixture
        .get_json(&format!("/torrent?magnetLink={ENCODED_MAGNET}"))
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_videos_are_served_from_library() {
    let fixture = ApiFixture::new(MockTransferBackend::new());
    std::fs::write(
        fixture.config.library.directory.join("clip.mp4"),
        b"not really a video",
    )
    .unwrap();

    let (status, body) = fixture.get("/videos/clip.mp4").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"not really a video");
}
