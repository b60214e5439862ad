//! Shared fakes for file-relay unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::notifier::{LinkButton, MessageHandle, Notifier, NotifierError};
use crate::object_store::{LocalStore, MultipartSettings, ObjectStore, ObjectStoreError, PutRequest};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::transfer::{ByteStream, ContentSource, JobRegistry, Relay, RelaySettings, TransferError};
use crate::AppState;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub enum FailMode {
    Transport,
    RateLimited(Duration),
}

impl FailMode {
    fn error(self) -> NotifierError {
        match self {
            FailMode::Transport => NotifierError::Transport("connection reset".to_string()),
            FailMode::RateLimited(retry_after) => NotifierError::RateLimited { retry_after },
        }
    }
}

type Edit = (MessageHandle, String, Vec<LinkButton>);

/// Notifier that records everything it is asked to do.
#[derive(Default)]
pub struct RecordingNotifier {
    fail: Option<FailMode>,
    next_id: AtomicU64,
    sent: Mutex<Vec<(String, String)>>,
    edits: Mutex<Vec<Edit>>,
    edit_attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send and edit fails with `mode`.
    pub fn failing(mode: FailMode) -> Self {
        Self {
            fail: Some(mode),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<Edit> {
        self.edits.lock().unwrap().clone()
    }

    pub fn edit_attempts(&self) -> usize {
        self.edit_attempts.load(Ordering::SeqCst)
    }

    /// The most recent successful edit.
    pub fn last_edit(&self) -> Option<Edit> {
        self.edits.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, chat_id: &str, text: &str) -> Result<MessageHandle, NotifierError> {
        if let Some(mode) = self.fail {
            return Err(mode.error());
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageHandle {
            chat_id: chat_id.to_string(),
            message_id: id.to_string(),
        })
    }

    async fn edit(
        &self,
        message: &MessageHandle,
        text: &str,
        buttons: &[LinkButton],
    ) -> Result<(), NotifierError> {
        self.edit_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(mode) = self.fail {
            return Err(mode.error());
        }
        self.edits
            .lock()
            .unwrap()
            .push((message.clone(), text.to_string(), buttons.to_vec()));
        Ok(())
    }
}

enum Tail {
    End,
    Stall,
    Fail(String),
}

/// Content source serving fixed chunks from memory.
pub struct MemorySource {
    chunks: Vec<Bytes>,
    tail: Tail,
}

impl MemorySource {
    pub fn new(data: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: data
                .chunks(chunk_size.max(1))
                .map(Bytes::copy_from_slice)
                .collect(),
            tail: Tail::End,
        }
    }

    /// After the chunks, the stream never yields again.
    pub fn stalling(mut self) -> Self {
        self.tail = Tail::Stall;
        self
    }

    /// After the chunks, the stream yields an error.
    pub fn failing(mut self, reason: &str) -> Self {
        self.tail = Tail::Fail(reason.to_string());
        self
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn open(&self) -> Result<ByteStream, TransferError> {
        let chunks = stream::iter(self.chunks.clone().into_iter().map(Ok));
        Ok(match &self.tail {
            Tail::End => chunks.boxed(),
            Tail::Stall => chunks.chain(stream::pending()).boxed(),
            Tail::Fail(reason) => {
                let error = TransferError::Source(reason.clone());
                chunks.chain(stream::once(async move { Err(error) })).boxed()
            }
        })
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub enum StoreMode {
    /// Wait inside `put_multipart` until the upload is cancelled.
    Stall,
    Fail(String),
}

/// Object store whose uploads never succeed. Other calls go to a `LocalStore`.
pub struct ScriptedStore {
    inner: LocalStore,
    mode: StoreMode,
    pub entered: Notify,
    aborted: AtomicBool,
}

impl ScriptedStore {
    pub fn new(base: &Path, mode: StoreMode) -> Self {
        Self {
            inner: LocalStore::new(base).unwrap(),
            mode,
            entered: Notify::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn put_multipart(
        &self,
        request: &PutRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ObjectStoreError> {
        self.entered.notify_one();
        match &self.mode {
            StoreMode::Stall => {
                let size = tokio::fs::metadata(&request.local_path).await?.len();
                progress.update(size / 2, size).await;
                cancel.cancelled().await;
                self.aborted.store(true, Ordering::SeqCst);
                Err(ObjectStoreError::Cancelled)
            }
            StoreMode::Fail(reason) => Err(ObjectStoreError::Backend(reason.clone())),
        }
    }

    async fn presigned_url(
        &self,
        key: &str,
        ttl: Duration,
        download_name: &str,
    ) -> Result<String, ObjectStoreError> {
        self.inner.presigned_url(key, ttl, download_name).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.inner.exists(key).await
    }
}

pub fn test_settings(temp_dir: &tempfile::TempDir) -> RelaySettings {
    RelaySettings {
        staging_dir: temp_dir.path().join("staging"),
        max_file_size: 4 * 1024 * MIB,
        link_ttl: Duration::from_secs(24 * 60 * 60),
        multipart: MultipartSettings {
            threshold: 8 * MIB,
            part_size: 8 * MIB,
            max_concurrency: 4,
        },
    }
}

pub fn store_dir(temp_dir: &tempfile::TempDir) -> PathBuf {
    temp_dir.path().join("store")
}

/// A relay wired to the given store and notifier with a short progress interval.
pub fn test_relay(
    settings: RelaySettings,
    store: Arc<dyn ObjectStore>,
    notifier: Arc<RecordingNotifier>,
) -> Arc<Relay> {
    let reporter = Arc::new(ProgressReporter::new(
        notifier.clone(),
        Duration::from_millis(10),
    ));
    Arc::new(Relay::new(
        settings,
        Arc::new(JobRegistry::new()),
        reporter,
        store,
        notifier,
    ))
}

/// App state over a local store with a recording notifier.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let store = Arc::new(LocalStore::new(store_dir(temp_dir)).unwrap());
    let relay = test_relay(
        test_settings(temp_dir),
        store,
        Arc::new(RecordingNotifier::new()),
    );
    Arc::new(AppState { relay })
}

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

#[derive(Clone)]
struct MockState {
    replies: Arc<HashMap<String, Value>>,
    file: Bytes,
    calls: Calls,
}

async fn mock_method(
    State(state): State<MockState>,
    UrlPath((_token, method)): UrlPath<(String, String)>,
    Json(params): Json<Value>,
) -> Json<Value> {
    state.calls.lock().unwrap().push((method.clone(), params));
    Json(
        state
            .replies
            .get(&method)
            .cloned()
            .unwrap_or_else(|| json!({"ok": true, "result": true})),
    )
}

async fn mock_file(State(state): State<MockState>) -> Bytes {
    state.file.clone()
}

/// In-process Bot API server answering each method with a canned reply.
pub struct MockTelegram {
    pub url: String,
    calls: Calls,
    server: JoinHandle<()>,
}

pub struct MockTelegramBuilder {
    replies: HashMap<String, Value>,
    file: Bytes,
}

impl MockTelegram {
    pub fn builder() -> MockTelegramBuilder {
        let mut replies = HashMap::new();
        replies.insert(
            "sendMessage".to_string(),
            json!({"ok": true, "result": {"message_id": 1, "chat": {"id": 0}}}),
        );
        MockTelegramBuilder {
            replies,
            file: Bytes::new(),
        }
    }

    /// Every method call received so far with its JSON parameters.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts of all `sendMessage` calls.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(method, _)| method == "sendMessage")
            .filter_map(|(_, params)| params["text"].as_str().map(str::to_string))
            .collect()
    }
}

impl Drop for MockTelegram {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockTelegramBuilder {
    pub fn reply(mut self, method: &str, body: Value) -> Self {
        self.replies.insert(method.to_string(), body);
        self
    }

    /// Body served for every file download.
    pub fn file(mut self, data: &[u8]) -> Self {
        self.file = Bytes::copy_from_slice(data);
        self
    }

    pub async fn start(self) -> MockTelegram {
        let calls: Calls = Arc::default();
        let state = MockState {
            replies: Arc::new(self.replies),
            file: self.file,
            calls: Arc::clone(&calls),
        };
        let app = Router::new()
            .route("/file/:token/*path", get(mock_file))
            .route("/:token/:method", post(mock_method))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockTelegram { url, calls, server }
    }
}

pub const MOCK_BUCKET: &str = "test-bucket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Op {
    PutObject,
    CreateUpload,
    UploadPart(i32),
    CompleteUpload,
    AbortUpload,
    DeleteObject,
    HeadObject,
    Unknown,
}

/// One request seen by [`MockS3`].
#[derive(Debug, Clone)]
pub struct S3Call {
    pub op: S3Op,
    pub key: String,
    pub content_type: Option<String>,
    /// `x-amz-meta-*` headers with the prefix stripped.
    pub metadata: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Clone, Copy, Default)]
enum PartFault {
    #[default]
    None,
    Fail(i32),
    Stall,
}

#[derive(Clone)]
struct S3State {
    fault: PartFault,
    part_delay: Duration,
    calls: Arc<Mutex<Vec<S3Call>>>,
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    parts: Arc<Mutex<BTreeMap<i32, Bytes>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    part_started: Arc<Notify>,
}

const UPLOAD_ID: &str = "upload-1";

fn classify(method: &Method, query: &HashMap<String, String>) -> S3Op {
    let part = query.get("partNumber").and_then(|n| n.parse().ok());
    let multipart = query.contains_key("uploadId");
    if method == Method::POST && query.contains_key("uploads") {
        S3Op::CreateUpload
    } else if method == Method::POST && multipart {
        S3Op::CompleteUpload
    } else if method == Method::PUT {
        part.map_or(S3Op::PutObject, S3Op::UploadPart)
    } else if method == Method::DELETE && multipart {
        S3Op::AbortUpload
    } else if method == Method::DELETE {
        S3Op::DeleteObject
    } else if method == Method::HEAD {
        S3Op::HeadObject
    } else {
        S3Op::Unknown
    }
}

fn xml(status: StatusCode, body: String) -> Response {
    (status, [("content-type", "application/xml")], body).into_response()
}

async fn mock_s3(
    State(state): State<S3State>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let op = classify(&method, &query);
    let raw_key = uri
        .path()
        .strip_prefix(&format!("/{MOCK_BUCKET}/"))
        .unwrap_or_default();
    let key = urlencoding::decode(raw_key).unwrap().into_owned();
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix("x-amz-meta-")?;
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    state.calls.lock().unwrap().push(S3Call {
        op,
        key: key.clone(),
        content_type: headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        metadata,
        body: body.clone(),
    });

    match op {
        S3Op::PutObject => {
            state.objects.lock().unwrap().insert(key, body);
            (StatusCode::OK, [("etag", "\"object\"")]).into_response()
        }
        S3Op::CreateUpload => {
            state.parts.lock().unwrap().clear();
            xml(
                StatusCode::OK,
                format!(
                    "<InitiateMultipartUploadResult><Bucket>{MOCK_BUCKET}</Bucket>\
                     <Key>{key}</Key><UploadId>{UPLOAD_ID}</UploadId></InitiateMultipartUploadResult>"
                ),
            )
        }
        S3Op::UploadPart(number) => {
            let running = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(running, Ordering::SeqCst);
            state.part_started.notify_one();

            match state.fault {
                PartFault::Stall => std::future::pending::<()>().await,
                PartFault::Fail(failing) if failing == number => {
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return xml(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "<Error><Code>InternalError</Code><Message>part rejected</Message></Error>"
                            .to_string(),
                    );
                }
                _ => {}
            }
            tokio::time::sleep(state.part_delay).await;
            state.parts.lock().unwrap().insert(number, body);
            state.in_flight.fetch_sub(1, Ordering::SeqCst);

            let etag = format!("\"etag-{number}\"");
            (StatusCode::OK, [("etag", etag)]).into_response()
        }
        S3Op::CompleteUpload => {
            let assembled: Vec<u8> = state
                .parts
                .lock()
                .unwrap()
                .values()
                .flat_map(|part| part.to_vec())
                .collect();
            state
                .objects
                .lock()
                .unwrap()
                .insert(key.clone(), Bytes::from(assembled));
            xml(
                StatusCode::OK,
                format!(
                    "<CompleteMultipartUploadResult><Bucket>{MOCK_BUCKET}</Bucket>\
                     <Key>{key}</Key><ETag>\"assembled\"</ETag></CompleteMultipartUploadResult>"
                ),
            )
        }
        S3Op::AbortUpload => {
            state.parts.lock().unwrap().clear();
            StatusCode::NO_CONTENT.into_response()
        }
        S3Op::DeleteObject => {
            state.objects.lock().unwrap().remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        S3Op::HeadObject => {
            if state.objects.lock().unwrap().contains_key(&key) {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        S3Op::Unknown => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// In-process S3 endpoint (path-style) holding objects and one multipart
/// upload in memory.
pub struct MockS3 {
    pub url: String,
    state: S3State,
    server: JoinHandle<()>,
}

#[derive(Default)]
pub struct MockS3Builder {
    fault: PartFault,
    part_delay: Duration,
}

impl MockS3 {
    pub fn builder() -> MockS3Builder {
        MockS3Builder::default()
    }

    pub fn calls(&self) -> Vec<S3Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<S3Op> {
        self.calls().into_iter().map(|call| call.op).collect()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.objects.lock().unwrap().get(key).cloned()
    }

    /// Most part uploads that were being served at the same time.
    pub fn max_parts_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once a part upload has reached the server.
    pub async fn part_started(&self) {
        self.state.part_started.notified().await;
    }
}

impl Drop for MockS3 {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockS3Builder {
    /// Answer part `number` with a 500.
    pub fn fail_part(mut self, number: i32) -> Self {
        self.fault = PartFault::Fail(number);
        self
    }

    /// Never answer part uploads.
    pub fn stall_parts(mut self) -> Self {
        self.fault = PartFault::Stall;
        self
    }

    /// Hold each part this long before answering.
    pub fn part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = delay;
        self
    }

    pub async fn start(self) -> MockS3 {
        let state = S3State {
            fault: self.fault,
            part_delay: self.part_delay,
            calls: Arc::default(),
            objects: Arc::default(),
            parts: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
            part_started: Arc::default(),
        };
        let app = Router::new().fallback(mock_s3).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockS3 { url, state, server }
    }
}
