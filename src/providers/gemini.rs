//! Google Gemini provider over the public `generativelanguage` REST API.
//!
//! Credential resolution: explicit API key from config, then the
//! `GEMINI_API_KEY` / `GOOGLE_API_KEY` environment variables.

use crate::providers::traits::{ChatMessage, Provider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PUBLIC_API_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Upper bound on generated output, in tokens.
const MAX_OUTPUT_TOKENS: u32 = 4096;

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: Option<String>,
    client: Client,
}

// ── API request/response types ──────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiProvider {
    pub fn new(api_key: Option<&str>) -> Self {
        let resolved = api_key
            .and_then(Self::normalize_non_empty)
            .or_else(|| Self::load_non_empty_env("GEMINI_API_KEY"))
            .or_else(|| Self::load_non_empty_env("GOOGLE_API_KEY"));

        Self {
            api_key: resolved,
            client: Client::new(),
        }
    }

    fn normalize_non_empty(value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn load_non_empty_env(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .as_deref()
            .and_then(Self::normalize_non_empty)
    }

    fn require_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No Gemini API key configured. Set api_key in config.toml or the GEMINI_API_KEY env var."
            )
        })
    }

    /// Convert unified messages to Gemini contents. The Gemini API uses
    /// "model" instead of "assistant"; system messages go into
    /// `systemInstruction` rather than the contents array.
    fn convert_messages(messages: &[ChatMessage]) -> (Vec<Content>, Option<Content>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut contents: Vec<Content> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(&msg.content),
                "user" => contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: msg.content.clone(),
                    }],
                }),
                "assistant" => contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part {
                        text: msg.content.clone(),
                    }],
                }),
                _ => {}
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part {
                    text: system_parts.join("\n\n"),
                }],
            })
        };

        (contents, system_instruction)
    }

    async fn send_generate_content(
        &self,
        contents: Vec<Content>,
        system_instruction: Option<Content>,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String> {
        let key = self.require_key()?;
        let url = format!("{PUBLIC_API_ENDPOINT}/models/{model}:generateContent?key={key}");

        let request = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let resp = self.client.post(&url).json(&request).send().await?;
        let status = resp.status();
        let body: GenerateContentResponse = resp.json().await?;

        if let Some(err) = body.error {
            anyhow::bail!("Gemini API error ({status}): {}", err.message);
        }

        let text = body
            .candidates
            .and_then(|mut c| {
                if c.is_empty() {
                    None
                } else {
                    Some(c.remove(0))
                }
            })
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.is_empty());

        text.ok_or_else(|| anyhow::anyhow!("Gemini returned no candidates"))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat_with_system(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String> {
        let system_instruction = system_prompt.map(|sys| Content {
            role: None,
            parts: vec![Part {
                text: sys.to_string(),
            }],
        });

        let contents = vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: message.to_string(),
            }],
        }];

        self.send_generate_content(contents, system_instruction, model, temperature)
            .await
    }

    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String> {
        let (contents, system_instruction) = Self::convert_messages(messages);
        self.send_generate_content(contents, system_instruction, model, temperature)
            .await
    }
}
