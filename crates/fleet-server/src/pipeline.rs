//! Audio Pipeline (C7): HTTP ingest of PCM, through STT, a prefix gate, a
//! fuzzy intent match, a dispatch through the command router, and a
//! synthesized confirmation sent back over the originating session.
//! STT, TTS, and fuzzy matching are external collaborators behind small
//! trait contracts — production default implementations call out over
//! HTTP; tests substitute fakes.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;

use crate::router::CommandRouter;
use crate::sessions::{OutboundFrame, SessionManager};
use crate::store::Store;
use crate::types::{AudioTranscript, DeviceId};

const AUDIO_CHUNK_BYTES: usize = 4096;

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &[u8]) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait IntentMatcher: Send + Sync {
    async fn match_intent(&self, text: &str) -> anyhow::Result<Option<(String, f64)>>;
}

/// Calls a local speech-to-text service over HTTP, the same pattern the
/// teacher uses for its local model services: a thin reqwest client, one
/// method per external call, `anyhow::Result` throughout.
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/octet-stream")
            .body(pcm.to_vec())
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body.get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("transcription response missing `text`"))
    }
}

pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

pub struct HttpIntentMatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIntentMatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl IntentMatcher for HttpIntentMatcher {
    async fn match_intent(&self, text: &str) -> anyhow::Result<Option<(String, f64)>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let intent = body.get("intent").and_then(|v| v.as_str());
        let confidence = body.get("confidence").and_then(|v| v.as_f64());
        Ok(match (intent, confidence) {
            (Some(intent), Some(confidence)) => Some((intent.to_string(), confidence)),
            _ => None,
        })
    }
}

const KNOWN_INTENTS: &[&str] = &[
    "forward",
    "backward",
    "left",
    "right",
    "stop",
    "resetposition",
    "handsup",
    "headleft",
    "headright",
    "headup",
    "headdown",
];

/// Local fallback matcher scoring the gated text against the closed intent
/// enumeration with Jaro-Winkler similarity. Useful when no external
/// fuzzy-matching service is configured (tests, local runs).
pub struct LocalFuzzyMatcher;

#[async_trait]
impl IntentMatcher for LocalFuzzyMatcher {
    async fn match_intent(&self, text: &str) -> anyhow::Result<Option<(String, f64)>> {
        let haystack = text.to_lowercase();
        let best = KNOWN_INTENTS
            .iter()
            .map(|intent| (*intent, strsim::jaro_winkler(&haystack, intent)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(intent, score)| (intent.to_string(), score)))
    }
}

/// Maps a closed enumeration of intent tokens to a `(device_type,
/// command_name)` pair. Movement verbs address the wheel class, pose verbs
/// the servo class.
fn map_intent(intent: &str) -> Option<(&'static str, &'static str)> {
    match intent {
        "forward" => Some(("wheel", "forward")),
        "backward" => Some(("wheel", "backward")),
        "left" => Some(("wheel", "left")),
        "right" => Some(("wheel", "right")),
        "stop" => Some(("wheel", "stop")),
        "resetposition" => Some(("servo", "resetposition")),
        "handsup" => Some(("servo", "handsup")),
        "headleft" => Some(("servo", "headleft")),
        "headright" => Some(("servo", "headright")),
        "headup" => Some(("servo", "headup")),
        "headdown" => Some(("servo", "headdown")),
        _ => None,
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_uppercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_prefix(normalized: &str, phrases: &[String]) -> Option<String> {
    for phrase in phrases {
        let phrase = phrase.to_uppercase();
        if let Some(rest) = normalized.strip_prefix(&phrase) {
            return Some(rest.trim().to_string());
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct UploadParams {
    pub device_id: DeviceId,
    pub manual: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadResult {
    pub matched: bool,
    pub reason: Option<String>,
    pub command_id: Option<String>,
    pub command_name: Option<String>,
}

pub struct AudioPipeline {
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    matcher: Arc<dyn IntentMatcher>,
    router: Arc<CommandRouter>,
    sessions: Arc<SessionManager>,
    store: Store,
    prefix_phrases: Vec<String>,
    confidence_threshold: f64,
    sample_rate: u32,
}

impl AudioPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        matcher: Arc<dyn IntentMatcher>,
        router: Arc<CommandRouter>,
        sessions: Arc<SessionManager>,
        store: Store,
        prefix_phrases: Vec<String>,
        confidence_threshold: f64,
        sample_rate: u32,
    ) -> Self {
        Self {
            transcriber,
            synthesizer,
            matcher,
            router,
            sessions,
            store,
            prefix_phrases,
            confidence_threshold,
            sample_rate,
        }
    }

    pub async fn process_upload(&self, params: UploadParams, pcm: Vec<u8>) -> UploadResult {
        let now = Utc::now();

        let raw_text = match self.transcriber.transcribe(&pcm).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(device_id = %params.device_id, error = %err, "transcription failed");
                self.persist_transcript(&params.device_id, "", "", false, None, None, params.manual, now)
                    .await;
                return UploadResult {
                    matched: false,
                    reason: Some("stt_failed".to_string()),
                    command_id: None,
                    command_name: None,
                };
            }
        };

        let normalized = normalize(&raw_text);

        let (prefix_ok, gated_text) = if params.manual {
            (true, normalized.clone())
        } else {
            match strip_prefix(&normalized, &self.prefix_phrases) {
                Some(stripped) => (true, stripped),
                None => (false, normalized.clone()),
            }
        };

        if !prefix_ok {
            self.persist_transcript(&params.device_id, &raw_text, &normalized, false, None, None, params.manual, now)
                .await;
            return UploadResult {
                matched: false,
                reason: Some("prefix_missing".to_string()),
                command_id: None,
                command_name: None,
            };
        }

        let matched = match self.matcher.match_intent(&gated_text).await {
            Ok(matched) => matched,
            Err(err) => {
                tracing::warn!(device_id = %params.device_id, error = %err, "intent match failed");
                self.persist_transcript(&params.device_id, &raw_text, &normalized, true, None, None, params.manual, now)
                    .await;
                return UploadResult {
                    matched: false,
                    reason: Some("match_failed".to_string()),
                    command_id: None,
                    command_name: None,
                };
            }
        };

        let (intent, confidence) = match matched {
            Some((intent, confidence)) if confidence >= self.confidence_threshold => (intent, confidence),
            Some((_, confidence)) => {
                self.persist_transcript(
                    &params.device_id,
                    &raw_text,
                    &normalized,
                    true,
                    None,
                    Some(confidence),
                    params.manual,
                    now,
                )
                .await;
                return UploadResult {
                    matched: false,
                    reason: Some("low_confidence".to_string()),
                    command_id: None,
                    command_name: None,
                };
            }
            None => {
                self.persist_transcript(&params.device_id, &raw_text, &normalized, true, None, None, params.manual, now)
                    .await;
                return UploadResult {
                    matched: false,
                    reason: Some("low_confidence".to_string()),
                    command_id: None,
                    command_name: None,
                };
            }
        };

        let Some((device_type, command_name)) = map_intent(&intent) else {
            self.persist_transcript(&params.device_id, &raw_text, &normalized, true, None, Some(confidence), params.manual, now)
                .await;
            return UploadResult {
                matched: false,
                reason: Some("unknown_intent".to_string()),
                command_id: None,
                command_name: None,
            };
        };

        let record = match self
            .router
            .dispatch(device_type, command_name, serde_json::json!({}), None)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(device_id = %params.device_id, error = format!("{err:#}"), "failed to dispatch matched command");
                self.persist_transcript(
                    &params.device_id,
                    &raw_text,
                    &normalized,
                    true,
                    Some(command_name),
                    Some(confidence),
                    params.manual,
                    now,
                )
                .await;
                return UploadResult {
                    matched: false,
                    reason: Some("dispatch_failed".to_string()),
                    command_id: None,
                    command_name: Some(command_name.to_string()),
                };
            }
        };

        self.persist_transcript(
            &params.device_id,
            &raw_text,
            &normalized,
            true,
            Some(command_name),
            Some(confidence),
            params.manual,
            now,
        )
        .await;

        let utterance = format!("Executing {command_name}");
        match self.synthesizer.synthesize(&utterance).await {
            Ok(pcm_reply) => self.send_audio_reply(&params.device_id, &pcm_reply).await,
            Err(err) => {
                tracing::warn!(device_id = %params.device_id, error = %err, "speech synthesis failed, skipping audio reply");
            }
        }

        UploadResult {
            matched: true,
            reason: None,
            command_id: Some(record.command_id.0),
            command_name: Some(command_name.to_string()),
        }
    }

    /// Synthesize `text` and stream it to `device_id` as a sequence of
    /// `audio_chunk` frames. Used by the operator-facing notify endpoint —
    /// a thin wrapper over synthesis plus the reply sender.
    pub async fn notify(&self, device_id: &DeviceId, text: &str) -> anyhow::Result<()> {
        let pcm = self.synthesizer.synthesize(text).await?;
        self.send_audio_reply(device_id, &pcm).await;
        Ok(())
    }

    async fn send_audio_reply(&self, device_id: &DeviceId, pcm: &[u8]) {
        if !self.sessions.is_online(device_id) {
            tracing::info!(%device_id, "originating session gone, skipping audio reply");
            return;
        }

        if pcm.is_empty() {
            self.sessions.send(
                device_id,
                OutboundFrame::AudioChunk {
                    audio_base64: String::new(),
                    is_last: true,
                    samplerate: self.sample_rate,
                    format: "pcm_s16le".to_string(),
                },
            );
            return;
        }

        let chunks: Vec<&[u8]> = pcm.chunks(AUDIO_CHUNK_BYTES).collect();
        let chunk_count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let frame = OutboundFrame::AudioChunk {
                audio_base64: base64::engine::general_purpose::STANDARD.encode(chunk),
                is_last: index + 1 == chunk_count,
                samplerate: self.sample_rate,
                format: "pcm_s16le".to_string(),
            };
            self.sessions.send(device_id, frame);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_transcript(
        &self,
        device_id: &DeviceId,
        raw_text: &str,
        normalized_text: &str,
        prefix_ok: bool,
        matched_command: Option<&str>,
        confidence: Option<f64>,
        manual: bool,
        timestamp: chrono::DateTime<Utc>,
    ) {
        let transcript = AudioTranscript {
            id: 0,
            device_id: device_id.clone(),
            raw_text: raw_text.to_string(),
            normalized_text: normalized_text.to_string(),
            prefix_ok,
            matched_command: matched_command.map(|s| s.to_string()),
            confidence,
            manual,
            timestamp,
        };
        if let Err(err) = self.store.insert_transcript(transcript).await {
            tracing::error!(%device_id, error = format!("{err:#}"), "failed to persist audio transcript");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    struct FixedTranscriber(&'static str);
    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _pcm: &[u8]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct SilentSynthesizer;
    #[async_trait]
    impl Synthesizer for SilentSynthesizer {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; 8])
        }
    }

    struct FixedMatcher(Option<(&'static str, f64)>);
    #[async_trait]
    impl IntentMatcher for FixedMatcher {
        async fn match_intent(&self, _text: &str) -> anyhow::Result<Option<(String, f64)>> {
            Ok(self.0.map(|(intent, confidence)| (intent.to_string(), confidence)))
        }
    }

    fn test_pipeline(transcript: &'static str, matcher_result: Option<(&'static str, f64)>) -> AudioPipeline {
        let store = Store::in_memory().unwrap();
        let registry = Arc::new(Registry::new(store.clone()));
        let sessions = SessionManager::new(registry, store.clone(), 8, vec![]);
        let router = CommandRouter::new(sessions.clone(), store.clone(), std::time::Duration::from_secs(30));
        sessions.set_router(router.clone());

        AudioPipeline::new(
            Arc::new(FixedTranscriber(transcript)),
            Arc::new(SilentSynthesizer),
            Arc::new(FixedMatcher(matcher_result)),
            router,
            sessions,
            store,
            vec!["ESP".to_string(), "NATIONAL PG".to_string()],
            0.70,
            16_000,
        )
    }

    #[tokio::test]
    async fn missing_prefix_is_rejected_without_dispatch() {
        let pipeline = test_pipeline("please go forward", Some(("forward", 0.92)));
        let result = pipeline
            .process_upload(
                UploadParams {
                    device_id: DeviceId::from("camcontroller"),
                    manual: false,
                },
                vec![0u8; 16],
            )
            .await;
        assert!(!result.matched);
        assert_eq!(result.reason.as_deref(), Some("prefix_missing"));
    }

    #[tokio::test]
    async fn low_confidence_is_rejected() {
        let pipeline = test_pipeline("ESP move forward", Some(("forward", 0.40)));
        let result = pipeline
            .process_upload(
                UploadParams {
                    device_id: DeviceId::from("camcontroller"),
                    manual: false,
                },
                vec![0u8; 16],
            )
            .await;
        assert!(!result.matched);
        assert_eq!(result.reason.as_deref(), Some("low_confidence"));
    }

    #[tokio::test]
    async fn happy_path_dispatches_with_no_online_wheel_session() {
        let pipeline = test_pipeline("ESP move forward", Some(("forward", 0.92)));
        let result = pipeline
            .process_upload(
                UploadParams {
                    device_id: DeviceId::from("camcontroller"),
                    manual: false,
                },
                vec![0u8; 16],
            )
            .await;
        // No wheel session is online in this unit test, but dispatch still
        // succeeds and returns a command id (status will be no_targets).
        assert!(result.matched);
        assert!(result.command_id.is_some());
    }

    #[tokio::test]
    async fn manual_flag_bypasses_prefix_gate() {
        let pipeline = test_pipeline("go forward please", Some(("forward", 0.92)));
        let result = pipeline
            .process_upload(
                UploadParams {
                    device_id: DeviceId::from("camcontroller"),
                    manual: true,
                },
                vec![0u8; 16],
            )
            .await;
        assert!(result.matched);
    }

    #[test]
    fn normalize_collapses_whitespace_and_upcases() {
        assert_eq!(normalize("  esp   move  forward "), "ESP MOVE FORWARD");
    }

    #[test]
    fn strip_prefix_matches_configured_phrase() {
        let phrases = vec!["ESP".to_string(), "NATIONAL PG".to_string()];
        assert_eq!(strip_prefix("ESP MOVE FORWARD", &phrases).as_deref(), Some("MOVE FORWARD"));
        assert_eq!(strip_prefix("PLEASE GO FORWARD", &phrases), None);
    }
}
