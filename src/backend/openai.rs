use std::{collections::HashMap, env, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::{
    BackendError, ChatCompletion, Classification, CompletionRequest, ModerationBackend,
    SynthesisRequest, SynthesizedRule,
};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

const SYNTHESIS_SYSTEM_PROMPT: &str = "\
Moderation policy assistant. Classify rules into layers. Return ONLY JSON.\n\n\
LAYERS:\n\
1. 'regex' - Pattern matching (e.g., 'block word X', 'ban URLs')\n\
   Fields: regex (pattern), rule_type='regex', priority\n\n\
2. 'category' - Moderation API (AI content detection)\n\
   Fields: category (EXACT match from list below), rule_type='semantic', priority\n\
   VALID CATEGORIES:\n\
   - hate, hate/threatening\n\
   - harassment, harassment/threatening\n\
   - self-harm, self-harm/intent, self-harm/instructions\n\
   - sexual, sexual/minors\n\
   - violence, violence/graphic\n\
   - illicit, illicit/violent\n\
   NO regex field for category!\n\n\
3. 'contextual' - Contextual analysis (custom categories)\n\
   Fields: category (e.g., 'spam', 'advertising', 'trolling'), rule_type='contextual', priority\n\
   NO regex field for contextual!\n\n\
RULES:\n\
- Use 'category' ONLY if category matches list above EXACTLY\n\
- Use 'contextual' for all other categories (spam, ads, etc.)\n\
- Never include 'regex' field for category/contextual\n\n\
Return JSON: {rule_type, layer, category, regex (regex only!), priority (0-100)}";

#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    moderation_model: String,
    synthesis_model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build moderation HTTP client: {error}"))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_owned(),
            moderation_model: "omni-moderation-latest".to_owned(),
            synthesis_model: "gpt-5-mini".to_owned(),
        })
    }

    pub fn from_env() -> Result<Option<Self>, String> {
        let Some(api_key) = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        let base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_owned());
        let timeout_secs = env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(15);

        Self::new(api_key, base_url, Duration::from_secs(timeout_secs)).map(Some)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value, BackendError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_transient = BackendError::Unavailable("no attempt made".to_owned());

        for attempt in 1..=MAX_ATTEMPTS {
            debug!(path, attempt, backend = self.name(), "posting request");
            match self
                .client
                .post(self.url(path))
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await
            {
                Err(error) if error.is_timeout() => {
                    last_transient = BackendError::Timeout(error.to_string());
                }
                Err(error) => {
                    last_transient = BackendError::Unavailable(error.to_string());
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        last_transient = BackendError::Unavailable(format!(
                            "status {}: {}",
                            status.as_u16(),
                            truncate(&body)
                        ));
                    } else if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(BackendError::Rejected(format!(
                            "status {}: {}",
                            status.as_u16(),
                            truncate(&body)
                        )));
                    } else {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|error| BackendError::InvalidResponse(error.to_string()));
                    }
                }
            }

            if attempt < MAX_ATTEMPTS {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                warn!(
                    path,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_transient,
                    "transient backend failure, retrying"
                );
                sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        Err(last_transient)
    }

    async fn classify_input(&self, input: Value) -> Result<Classification, BackendError> {
        let payload = json!({
            "model": self.moderation_model,
            "input": [input],
        });
        let data = self.post("/moderations", &payload).await?;
        let parsed: ModerationResponse = serde_json::from_value(data)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        let result = parsed.results.into_iter().next().ok_or_else(|| {
            BackendError::InvalidResponse("missing results in moderation response".to_owned())
        })?;

        Ok(Classification {
            flagged: result.flagged,
            categories: result.categories,
            category_scores: result.category_scores,
        })
    }
}

#[async_trait]
impl ModerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai-backend"
    }

    async fn classify_text(&self, text: &str) -> Result<Classification, BackendError> {
        self.classify_input(json!({"type": "text", "text": text}))
            .await
    }

    async fn classify_image(&self, image: &str) -> Result<Classification, BackendError> {
        self.classify_input(json!({"type": "image_url", "image_url": {"url": image}}))
            .await
    }

    async fn complete_chat(
        &self,
        request: CompletionRequest,
    ) -> Result<ChatCompletion, BackendError> {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(limit) = request.max_completion_tokens {
            payload["max_completion_tokens"] = json!(limit);
        }
        if request.json_response {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let data = self.post("/chat/completions", &payload).await?;
        let parsed: CompletionResponse = serde_json::from_value(data)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            BackendError::InvalidResponse("missing choices in completion response".to_owned())
        })?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_owned()),
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    async fn synthesize_rule(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesizedRule, BackendError> {
        let user_prompt = format!(
            "Rule: {}\nSource: {}\nAction: {}",
            request.rule_text,
            request.source.name(),
            request.desired_action
        );
        let completion = self
            .complete_chat(CompletionRequest {
                model: self.synthesis_model.clone(),
                messages: vec![
                    json!({"role": "system", "content": SYNTHESIS_SYSTEM_PROMPT}),
                    json!({"role": "user", "content": user_prompt}),
                ],
                max_completion_tokens: None,
                json_response: true,
            })
            .await?;

        let trimmed = completion
            .content
            .trim_matches(|c: char| c == '`' || c.is_whitespace());
        let parsed: Value = serde_json::from_str(trimmed).map_err(|error| {
            BackendError::InvalidResponse(format!(
                "rule synthesis returned non-JSON content: {error}"
            ))
        })?;

        Ok(SynthesizedRule {
            rule_type: field_string(&parsed, "rule_type").unwrap_or_else(|| "semantic".to_owned()),
            layer: field_string(&parsed, "layer").unwrap_or_else(|| "contextual".to_owned()),
            category: field_string(&parsed, "category"),
            regex: field_string(&parsed, "regex"),
            priority: parsed.get("priority").and_then(Value::as_i64).unwrap_or(10),
        })
    }
}

fn field_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

fn truncate(body: &str) -> String {
    body.chars().take(400).collect()
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationEntry>,
}

#[derive(Debug, Deserialize)]
struct ModerationEntry {
    flagged: bool,
    #[serde(default)]
    categories: HashMap<String, bool>,
    #[serde(default)]
    category_scores: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
