//! End-to-end scenarios driven over a real bound listener: command
//! dispatch, the no-targets path, audio ingest happy path and prefix
//! rejection, and session re-registration. Device sessions connect with a
//! real websocket client since axum's upgrade cannot be exercised through
//! an in-process `oneshot` call.

use async_trait::async_trait;
use fleet_server::api::{self, AppState};
use fleet_server::logbuf::LogBuffer;
use fleet_server::pipeline::{AudioPipeline, IntentMatcher, Synthesizer, Transcriber};
use fleet_server::registry::Registry;
use fleet_server::router::CommandRouter;
use fleet_server::sessions::SessionManager;
use fleet_server::store::Store;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

struct FixedTranscriber(String);
#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _pcm: &[u8]) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

struct SilentSynthesizer;
#[async_trait]
impl Synthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
        Ok(vec![1, 2, 3, 4, 5, 6, 7, 8])
    }
}

struct FixedMatcher(Option<(String, f64)>);
#[async_trait]
impl IntentMatcher for FixedMatcher {
    async fn match_intent(&self, _text: &str) -> anyhow::Result<Option<(String, f64)>> {
        Ok(self.0.clone())
    }
}

struct TestApp {
    base_url: String,
    ws_url: String,
}

async fn spawn_app(transcript: &str, matched: Option<(&str, f64)>) -> TestApp {
    let store = Store::in_memory().unwrap();
    let registry = Arc::new(Registry::new(store.clone()));
    let sessions = SessionManager::new(registry.clone(), store.clone(), 8, vec!["dashboard".to_string()]);
    let router = CommandRouter::new(sessions.clone(), store.clone(), Duration::from_secs(5));
    sessions.set_router(router.clone());

    let pipeline = Arc::new(AudioPipeline::new(
        Arc::new(FixedTranscriber(transcript.to_string())),
        Arc::new(SilentSynthesizer),
        Arc::new(FixedMatcher(matched.map(|(intent, confidence)| (intent.to_string(), confidence)))),
        router.clone(),
        sessions.clone(),
        store.clone(),
        vec!["ESP".to_string(), "NATIONAL PG".to_string()],
        0.70,
        16_000,
    ));

    let state = AppState {
        registry,
        sessions,
        router,
        store,
        pipeline,
        logs: Arc::new(LogBuffer::new(64)),
        read_limit_default: 50,
        read_limit_max: 500,
        started_at: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}"),
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(ws_url: &str, device_id: &str, device_type: &str) -> WsStream {
    let (mut stream, _) = tokio_tungstenite::connect_async(format!("{ws_url}/ws/{device_id}"))
        .await
        .expect("websocket upgrade failed");
    stream
        .send(Message::Text(
            json!({"message_type": "registration", "device_type": device_type, "metadata": {}}).to_string().into(),
        ))
        .await
        .unwrap();
    stream
}

async fn next_json(stream: &mut WsStream) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn scenario_a_happy_path_command() {
    let app = spawn_app("unused", None).await;
    let mut wheel = connect(&app.ws_url, "wheelcontroller", "wheel").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let dispatch: Value = client
        .post(format!("{}/command", app.base_url))
        .query(&[("device_type", "wheel"), ("command_name", "forward")])
        .json(&json!({"speed": 200}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dispatch["status"], "sent");
    assert_eq!(dispatch["target_device_count"], 1);

    let frame = next_json(&mut wheel).await;
    assert_eq!(frame["message_type"], "command");
    assert_eq!(frame["command_name"], "forward");
    assert_eq!(frame["payload"]["speed"], 200);
    let command_id = frame["command_id"].as_str().unwrap().to_string();

    wheel
        .send(Message::Text(
            json!({
                "message_type": "command_ack",
                "device_type": "wheel",
                "command_id": command_id,
                "status": "success",
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let mut final_status = String::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let logs: Value = client
            .get(format!("{}/command-logs", app.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if let Some(entry) = logs["commands"].as_array().unwrap().iter().find(|c| c["command_id"] == command_id) {
            final_status = entry["status"].as_str().unwrap().to_string();
            if final_status == "ack_success" {
                break;
            }
        }
    }
    assert_eq!(final_status, "ack_success");
}

#[tokio::test]
async fn scenario_b_no_targets() {
    let app = spawn_app("unused", None).await;
    let client = reqwest::Client::new();
    let dispatch: Value = client
        .post(format!("{}/command", app.base_url))
        .query(&[("device_type", "servo"), ("command_name", "handsup")])
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dispatch["status"], "no_targets");
    assert_eq!(dispatch["target_device_count"], 0);
}

#[tokio::test]
async fn scenario_d_audio_happy_path() {
    let app = spawn_app("ESP move forward", Some(("forward", 0.92))).await;
    let mut cam = connect(&app.ws_url, "camcontroller", "audio").await;
    let mut wheel = connect(&app.ws_url, "wheelcontroller", "wheel").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let upload: Value = client
        .post(format!("{}/audio/upload", app.base_url))
        .query(&[("device_id", "camcontroller")])
        .header("content-type", "application/octet-stream")
        .body(vec![0u8; 32])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(upload["matched"], true);
    assert_eq!(upload["command_name"], "forward");

    let command_frame = next_json(&mut wheel).await;
    assert_eq!(command_frame["message_type"], "command");
    assert_eq!(command_frame["command_name"], "forward");

    let audio_frame = next_json(&mut cam).await;
    assert_eq!(audio_frame["message_type"], "audio_chunk");
    assert_eq!(audio_frame["is_last"], true);

    let transcripts: Value = client
        .get(format!("{}/audio/transcripts", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let latest = &transcripts["transcripts"][0];
    assert_eq!(latest["prefix_ok"], true);
    assert_eq!(latest["matched_command"], "forward");
}

#[tokio::test]
async fn scenario_e_prefix_missing() {
    let app = spawn_app("please go forward", Some(("forward", 0.92))).await;
    let client = reqwest::Client::new();
    let upload: Value = client
        .post(format!("{}/audio/upload", app.base_url))
        .query(&[("device_id", "camcontroller")])
        .header("content-type", "application/octet-stream")
        .body(vec![0u8; 32])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(upload["matched"], false);
    assert_eq!(upload["reason"], "prefix_missing");

    let transcripts: Value = client
        .get(format!("{}/audio/transcripts", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let latest = &transcripts["transcripts"][0];
    assert_eq!(latest["prefix_ok"], false);
    assert!(latest["matched_command"].is_null());
}

#[tokio::test]
async fn scenario_f_reregistration_replaces_prior_session() {
    let app = spawn_app("unused", None).await;
    let mut first = connect(&app.ws_url, "shared-device", "wheel").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _second = connect(&app.ws_url, "shared-device", "wheel").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed = matches!(
        tokio::time::timeout(Duration::from_secs(2), first.next()).await,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_)))
    );
    assert!(closed, "prior session should be closed on re-registration");

    let client = reqwest::Client::new();
    let history: Value = client
        .get(format!("{}/device-connection-history/shared-device", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history["events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["kind"] == "reregistered"));

    let devices: Value = client.get(format!("{}/devices", app.base_url)).send().await.unwrap().json().await.unwrap();
    let device = devices["devices"]
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["device_id"] == "shared-device")
        .unwrap();
    assert_eq!(device["is_online"], true);
}
