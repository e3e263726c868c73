//! End-to-end gateway tests: real router, scripted provider, recording
//! channel, live dispatch queue.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use herald::channels::{Channel, ChannelEvent, ChannelInfo};
use herald::dispatch::{Dispatcher, JobReceiver};
use herald::gateway::{router, AppState};
use herald::generator::Generator;
use herald::history::{MessageRef, MessageStore, StoredMessage};
use herald::providers::{ChatMessage, Provider};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const API_KEY: &str = "hook-secret";

#[derive(Debug)]
struct ScriptedProvider {
    reply: Result<String, String>,
    calls: AtomicUsize,
    last_system: Mutex<Option<String>>,
}

impl ScriptedProvider {
    fn ok(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_system: Mutex::new(None),
        }
    }

    fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
            last_system: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_with_system(
        &self,
        _system_prompt: Option<&str>,
        _message: &str,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        unreachable!("gateway paths use chat_with_history")
    }

    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system.lock() = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone());
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(reason) => Err(anyhow::anyhow!("{reason}")),
        }
    }
}

#[derive(Default)]
struct RecordingChannel {
    existing_channels: Vec<String>,
    sends: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    fn with_channels(ids: &[&str]) -> Self {
        Self {
            existing_channels: ids.iter().map(|s| s.to_string()).collect(),
            sends: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageStore for RecordingChannel {
    async fn resolve(&self, _reference: &MessageRef) -> anyhow::Result<Option<StoredMessage>> {
        Ok(None)
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn identify(&self) -> anyhow::Result<String> {
        Ok("999".to_string())
    }

    fn is_self(&self, author_id: &str) -> bool {
        author_id == "999"
    }

    async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        self.sends.lock().push((channel_id.into(), text.into()));
        Ok(())
    }

    async fn reply(&self, _channel_id: &str, _message_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<ChannelInfo>> {
        Ok(self
            .existing_channels
            .iter()
            .find(|id| id.as_str() == channel_id)
            .map(|id| ChannelInfo {
                id: id.clone(),
                name: None,
            }))
    }

    async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelEvent>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Harness {
    app: axum::Router,
    provider: Arc<ScriptedProvider>,
    channel: Arc<RecordingChannel>,
    jobs: Option<JobReceiver>,
}

fn harness(
    provider: ScriptedProvider,
    channel: RecordingChannel,
    default_notify_channel_id: Option<u64>,
) -> Harness {
    let provider = Arc::new(provider);
    let channel = Arc::new(channel);
    let (dispatcher, jobs) = Dispatcher::channel(16);

    let generator = Arc::new(Generator::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "test-model",
        0.7,
        Duration::from_secs(5),
    ));

    let state = AppState {
        generator,
        chat: Arc::clone(&channel) as Arc<dyn Channel>,
        dispatcher,
        api_key: Arc::from(API_KEY),
        system_prompt: Arc::from("persona prompt"),
        default_notify_channel_id,
    };

    Harness {
        app: router(state),
        provider,
        channel,
        jobs: Some(jobs),
    }
}

impl Harness {
    /// Drain dispatched jobs on a background task, as the chat loop would.
    fn spawn_chat_loop(&mut self) {
        let mut jobs = self.jobs.take().expect("jobs already taken");
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job().await;
            }
        });
    }

    fn nothing_scheduled(&mut self) -> bool {
        matches!(
            self.jobs.as_mut().expect("jobs already taken").try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty)
        )
    }
}

fn post_json(uri: &str, api_key: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── /chat ───────────────────────────────────────────────────────

#[tokio::test]
async fn chat_returns_generator_text_unmodified() {
    let h = harness(
        ScriptedProvider::ok("generated reply, verbatim ✓"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/chat",
            Some(API_KEY),
            &serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["response"], "generated reply, verbatim ✓");
}

#[tokio::test]
async fn chat_uses_the_persona_system_prompt() {
    let h = harness(
        ScriptedProvider::ok("ok"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/chat",
            Some(API_KEY),
            &serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.provider.last_system.lock().as_deref(),
        Some("persona prompt")
    );
}

#[tokio::test]
async fn chat_rejects_bad_api_key() {
    let h = harness(
        ScriptedProvider::ok("unused"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/chat",
            Some("wrong-key"),
            &serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chat_rejects_missing_api_key() {
    let h = harness(
        ScriptedProvider::ok("unused"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/chat",
            None,
            &serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_rejects_malformed_body_as_unprocessable() {
    let h = harness(
        ScriptedProvider::ok("unused"),
        RecordingChannel::default(),
        None,
    );

    // Wrong field name
    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/chat",
            Some(API_KEY),
            &serde_json::json!({"msg": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Invalid JSON
    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header("Content-Type", "application/json")
        .header("X-API-Key", API_KEY)
        .body(Body::from("{not json"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn chat_surfaces_generation_failure_with_reason() {
    let h = harness(
        ScriptedProvider::failing("quota exhausted"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/chat",
            Some(API_KEY),
            &serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("provider error"));
}

// ── /notify ─────────────────────────────────────────────────────

#[tokio::test]
async fn notify_schedules_delivery_on_the_chat_loop() {
    let mut h = harness(
        ScriptedProvider::ok("maintenance window at 22:00"),
        RecordingChannel::with_channels(&["42"]),
        None,
    );
    h.spawn_chat_loop();

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "maintenance tonight", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    // Delivery is asynchronous; wait for the loop to run the job.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let sends = h.channel.sends.lock();
            if !sends.is_empty() {
                assert_eq!(
                    *sends,
                    vec![("42".to_string(), "maintenance window at 22:00".to_string())]
                );
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "notification was never delivered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn notify_appends_the_task_instruction_to_the_persona() {
    let mut h = harness(
        ScriptedProvider::ok("body"),
        RecordingChannel::with_channels(&["42"]),
        None,
    );
    h.spawn_chat_loop();

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "deploy done", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let system = h.provider.last_system.lock().clone().unwrap();
    assert!(system.starts_with("persona prompt"));
    assert!(system.contains("notification"));
}

#[tokio::test]
async fn notify_falls_back_to_the_configured_default_channel() {
    let mut h = harness(
        ScriptedProvider::ok("ping"),
        RecordingChannel::with_channels(&["7"]),
        Some(7),
    );
    h.spawn_chat_loop();

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "no explicit channel"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn notify_unknown_channel_is_404_and_nothing_is_scheduled() {
    let mut h = harness(
        ScriptedProvider::ok("never delivered"),
        RecordingChannel::with_channels(&[]),
        None,
    );

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "maintenance tonight", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.nothing_scheduled());
    assert!(h.channel.sends.lock().is_empty());
}

#[tokio::test]
async fn notify_without_any_channel_is_400_but_generation_already_ran() {
    let mut h = harness(
        ScriptedProvider::ok("wasted"),
        RecordingChannel::default(),
        None,
    );

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "maintenance tonight"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // Reference ordering: generation happens before the channel check fails.
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
    assert!(h.nothing_scheduled());
}

#[tokio::test]
async fn notify_generation_failure_is_500_and_nothing_is_scheduled() {
    let mut h = harness(
        ScriptedProvider::failing("model offline"),
        RecordingChannel::with_channels(&["42"]),
        None,
    );

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "maintenance tonight", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.nothing_scheduled());
}

#[tokio::test]
async fn notify_rejects_bad_api_key() {
    let h = harness(
        ScriptedProvider::ok("unused"),
        RecordingChannel::with_channels(&["42"]),
        None,
    );

    let response = h
        .app
        .oneshot(post_json(
            "/notify",
            Some("wrong"),
            &serde_json::json!({"prompt": "x", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn notify_when_chat_loop_is_gone_is_500() {
    let mut h = harness(
        ScriptedProvider::ok("undeliverable"),
        RecordingChannel::with_channels(&["42"]),
        None,
    );
    // Drop the receiving half: the run-loop is gone.
    drop(h.jobs.take());

    let response = h
        .app
        .clone()
        .oneshot(post_json(
            "/notify",
            Some(API_KEY),
            &serde_json::json!({"prompt": "maintenance tonight", "channel_id": 42}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("not accepting work"));
}
