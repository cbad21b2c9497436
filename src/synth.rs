//! Text-to-speech in front of the playback device.
//!
//! Synthesis descriptions are turned into audio right before playback, while
//! the request already holds the device slot. The HTTP synthesizer speaks the
//! OpenAI-compatible `/audio/speech` dialect; servers that also produce
//! lip-sync data may answer with JSON carrying base64 audio plus viseme cues.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{AudioClip, PlaybackError};
use crate::config::TtsConfig;

/// What an avatar wants said, and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

impl SynthesisRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One mouth shape on the lip-sync timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisemeCue {
    pub offset_ms: u64,
    pub shape: String,
}

/// Synthesized audio plus its lip-sync timeline.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub clip: AudioClip,
    pub visemes: Vec<VisemeCue>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Synthesized, PlaybackError>;
}

#[derive(Deserialize)]
struct JsonSpeech {
    audio: String,
    #[serde(default)]
    visemes: Vec<VisemeCue>,
}

/// Synthesizer backed by an OpenAI-compatible speech endpoint.
pub struct HttpSynthesizer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    default_voice: String,
    speed: f32,
}

impl HttpSynthesizer {
    pub fn new(config: &TtsConfig) -> Result<Self, PlaybackError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlaybackError::Synthesis(format!("Failed to create HTTP client: {e}")))?;

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("TTS_API_KEY").ok());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            default_voice: config.default_voice.clone(),
            speed: config.speed,
        })
    }
}

/// Decode a JSON speech response (`{"audio": <base64>, "visemes": [...]}`).
fn decode_json_speech(body: &[u8]) -> Result<Synthesized, PlaybackError> {
    let parsed: JsonSpeech = serde_json::from_slice(body)
        .map_err(|e| PlaybackError::Synthesis(format!("Failed to parse speech JSON: {e}")))?;
    let audio = base64::engine::general_purpose::STANDARD
        .decode(parsed.audio.as_bytes())
        .map_err(|e| PlaybackError::Synthesis(format!("Invalid base64 audio: {e}")))?;

    Ok(Synthesized {
        clip: AudioClip::encoded(audio),
        visemes: parsed.visemes,
    })
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Synthesized, PlaybackError> {
        let t_start = Instant::now();
        let voice = request.voice.as_deref().unwrap_or(&self.default_voice);

        let mut body = json!({
            "model": self.model,
            "input": request.text,
            "voice": voice,
            "speed": request.speed.unwrap_or(self.speed),
            "response_format": "wav",
        });
        if let Some(emotion) = &request.emotion {
            body["instructions"] = json!(format!("Speak in a {emotion} tone."));
        }

        let url = format!("{}/audio/speech", self.base_url);
        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let resp = call.send().await.map_err(|e| {
            if e.is_timeout() {
                PlaybackError::Synthesis("TTS request timed out".into())
            } else {
                PlaybackError::Synthesis(format!("TTS request failed: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            return Err(PlaybackError::Synthesis(format!(
                "TTS endpoint returned status {}",
                resp.status()
            )));
        }

        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PlaybackError::Synthesis(format!("Failed to read TTS response: {e}")))?;

        let synthesized = if is_json {
            decode_json_speech(&bytes)?
        } else {
            Synthesized {
                clip: AudioClip::encoded(bytes.to_vec()),
                visemes: Vec::new(),
            }
        };

        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Synthesized {} chars with voice {voice} ({latency_ms:.0}ms, {} visemes)",
            request.text.len(),
            synthesized.visemes.len()
        );
        debug!("Synthesized clip duration: {:?}", synthesized.clip.duration());

        Ok(synthesized)
    }
}
