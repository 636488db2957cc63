use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Regex,
    Category,
    Contextual,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Regex => "regex",
            LayerKind::Category => "category",
            LayerKind::Contextual => "contextual",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "regex" => Some(LayerKind::Regex),
            "category" => Some(LayerKind::Category),
            "contextual" => Some(LayerKind::Contextual),
            _ => None,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Delete,
    Warn,
    Mute,
    Ban,
    None,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Delete => "delete",
            Action::Warn => "warn",
            Action::Mute => "mute",
            Action::Ban => "ban",
            Action::None => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "delete" => Some(Action::Delete),
            "warn" => Some(Action::Warn),
            "mute" => Some(Action::Mute),
            "ban" => Some(Action::Ban),
            "none" => Some(Action::None),
            _ => None,
        }
    }

    /// Normalizes action vocabulary coming from external classifiers.
    /// Unknown values fall back to `warn`.
    pub fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim().to_ascii_lowercase();
        let canonical = match trimmed.as_str() {
            "delete_message" | "remove_message" | "remove" => "delete",
            "kick" | "ban_user" => "ban",
            "no_action" => "none",
            other => other,
        };
        Action::from_name(canonical).unwrap_or(Action::Warn)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

// Declared ascending so the derived ordering matches the wire ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPriority {
    Other = 10,
    Spam = 50,
    Hate = 70,
    Nsfw = 80,
    Threats = 100,
}

impl ViolationPriority {
    pub fn rank(&self) -> i64 {
        *self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            10 => Some(ViolationPriority::Other),
            50 => Some(ViolationPriority::Spam),
            70 => Some(ViolationPriority::Hate),
            80 => Some(ViolationPriority::Nsfw),
            100 => Some(ViolationPriority::Threats),
            _ => None,
        }
    }

    /// Buckets a 0–100 synthesizer score into the nearest lower-or-equal
    /// named priority.
    pub fn bucket(score: i64) -> Self {
        let bounded = score.clamp(0, 100);
        if bounded >= 90 {
            ViolationPriority::Threats
        } else if bounded >= 70 {
            ViolationPriority::Nsfw
        } else if bounded >= 60 {
            ViolationPriority::Hate
        } else if bounded >= 40 {
            ViolationPriority::Spam
        } else {
            ViolationPriority::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Admin,
    Auto,
}

impl RuleSource {
    pub fn name(&self) -> &'static str {
        match self {
            RuleSource::Admin => "admin",
            RuleSource::Auto => "auto",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "admin" => Some(RuleSource::Admin),
            "auto" => Some(RuleSource::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Regex,
    Semantic,
    Contextual,
}

impl RuleType {
    pub fn name(&self) -> &'static str {
        match self {
            RuleType::Regex => "regex",
            RuleType::Semantic => "semantic",
            RuleType::Contextual => "contextual",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "regex" => Some(RuleType::Regex),
            "semantic" => Some(RuleType::Semantic),
            "contextual" => Some(RuleType::Contextual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatContext {
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub context: ChatContext,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MessageEnvelope {
    /// First non-empty of text and caption, empty string otherwise.
    pub fn content_text(&self) -> &str {
        self.text
            .as_deref()
            .filter(|text| !text.is_empty())
            .or_else(|| self.caption.as_deref().filter(|caption| !caption.is_empty()))
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRule {
    pub rule_id: String,
    pub description: String,
    pub action: Action,
    pub source: RuleSource,
    pub layer: LayerKind,
    pub rule_type: RuleType,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub priority: ViolationPriority,
    #[serde(default)]
    pub action_duration_seconds: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationVerdict {
    pub layer: LayerKind,
    pub rule_code: String,
    pub priority: ViolationPriority,
    pub action: Action,
    pub reason: String,
    pub violated: bool,
    pub details: Map<String, Value>,
}

impl ModerationVerdict {
    pub fn short_circuit(&self) -> bool {
        self.violated && self.action != Action::None
    }
}

#[derive(Debug, Clone)]
pub struct ModerationResult {
    pub message: MessageEnvelope,
    pub verdict: Option<ModerationVerdict>,
    pub evaluated_layers: Vec<LayerKind>,
}
