use std::path::PathBuf;
use std::time::Duration;

use drivevault::errors::{TransferError, UploadError};
use drivevault::upload::drive::CHUNK_ALIGNMENT;
use drivevault::upload::{DriveStore, ObjectStore, RetryPolicy, ServiceAccountKey, UploadTarget, Uploader};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_PRIVATE_KEY: &str = include_str!("fixtures/service_account_key.pem");
const TOTAL: usize = CHUNK_ALIGNMENT + 44 * 1024;
const FOLDER_ID: &str = "1FolderXyz";
const NAME: &str = "agent_152t-backup-2025-01-01_000000.enc";

fn credential(server: &MockServer) -> ServiceAccountKey {
    let json = serde_json::json!({
        "type": "service_account",
        "private_key_id": "test-key-1",
        "private_key": TEST_PRIVATE_KEY,
        "client_email": "backup-bot@backup-test.iam.gserviceaccount.com",
        "token_uri": format!("{}/token", server.uri()),
    });
    ServiceAccountKey::from_json(&json.to_string()).unwrap()
}

fn store(server: &MockServer) -> DriveStore {
    DriveStore::new()
        .unwrap()
        .with_upload_url(format!("{}/upload/drive/v3/files", server.uri()))
}

fn artifact(dir: &tempfile::TempDir, len: usize) -> PathBuf {
    let file = dir.path().join(NAME);
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, bytes).unwrap();
    file
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
        .and(body_string_contains("assertion="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.test-token",
            "expires_in": 3599,
            "token_type": "Bearer",
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_session(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(query_param("uploadType", "resumable"))
        .and(header("Authorization", "Bearer ya29.test-token"))
        .and(body_string_contains(FOLDER_ID))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Location", format!("{}/upload/session/abc", server.uri()).as_str()),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn first_chunk_range() -> String {
    format!("bytes 0-{}/{}", CHUNK_ALIGNMENT - 1, TOTAL)
}

fn last_chunk_range() -> String {
    format!("bytes {}-{}/{}", CHUNK_ALIGNMENT, TOTAL - 1, TOTAL)
}

fn committed_first_chunk() -> ResponseTemplate {
    ResponseTemplate::new(308).insert_header("Range", format!("bytes=0-{}", CHUNK_ALIGNMENT - 1).as_str())
}

fn created() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "drive-file-1", "name": NAME }))
}

#[tokio::test]
async fn uploads_in_chunks_and_returns_file_id() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    mount_session(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", first_chunk_range().as_str()))
        .respond_with(committed_first_chunk())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", last_chunk_range().as_str()))
        .respond_with(created())
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, TOTAL);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: CHUNK_ALIGNMENT };

    let object = store(&server).put_file(&file, NAME, &target).await.unwrap();
    assert_eq!(object.id, "drive-file-1");
    assert_eq!(object.name, NAME);
}

#[tokio::test]
async fn retry_resumes_from_committed_range() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    mount_session(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", first_chunk_range().as_str()))
        .respond_with(committed_first_chunk())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", last_chunk_range().as_str()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", format!("bytes */{TOTAL}").as_str()))
        .respond_with(committed_first_chunk())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", last_chunk_range().as_str()))
        .respond_with(created())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, TOTAL);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: CHUNK_ALIGNMENT };
    let drive = store(&server);

    let object = Uploader::new(&drive, fast_policy(), Duration::from_secs(30))
        .upload(&file, NAME, &target, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(object.id, "drive-file-1");
}

#[tokio::test]
async fn expired_session_starts_over() {
    let server = MockServer::start().await;
    let small = 1024;
    mount_token(&server, 1).await;
    mount_session(&server, 2).await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", format!("bytes 0-{}/{}", small - 1, small).as_str()))
        .respond_with(created())
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, small);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: 0 };
    let drive = store(&server);

    let first = drive.put_file(&file, NAME, &target).await.unwrap_err();
    assert!(matches!(first, TransferError::SessionExpired));
    assert!(first.is_transient());

    let object = drive.put_file(&file, NAME, &target).await.unwrap();
    assert_eq!(object.id, "drive-file-1");
}

#[tokio::test]
async fn rejected_credential_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Invalid JWT Signature.",
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_session(&server, 0).await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, 1024);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: 0 };
    let drive = store(&server);

    let err = Uploader::new(&drive, fast_policy(), Duration::from_secs(30))
        .upload(&file, NAME, &target, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        UploadError::Permanent { attempts, source: TransferError::Auth(detail) } => {
            assert_eq!(attempts, 1);
            assert!(detail.contains("invalid_grant"));
        }
        other => panic!("expected a permanent auth failure, got {other:?}"),
    }
}

#[tokio::test]
async fn quota_error_is_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": { "errors": [{ "reason": "storageQuotaExceeded" }], "code": 403 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, 1024);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: 0 };
    let drive = store(&server);

    let err = Uploader::new(&drive, fast_policy(), Duration::from_secs(30))
        .upload(&file, NAME, &target, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Permanent { attempts: 1, .. }));
}

#[tokio::test]
async fn committed_range_past_end_is_a_protocol_error() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    mount_session(&server, 1).await;
    Mock::given(method("PUT"))
        .and(path("/upload/session/abc"))
        .and(header("Content-Range", "bytes 0-999/1000"))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-9999999"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = artifact(&dir, 1000);
    let key = credential(&server);
    let target = UploadTarget { folder_id: FOLDER_ID, credential: &key, chunk_size: 0 };

    let err = store(&server).put_file(&file, NAME, &target).await.unwrap_err();
    assert!(matches!(err, TransferError::Protocol { .. }), "got {err:?}");
    assert!(!err.is_transient());
}
