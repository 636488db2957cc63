use std::{
    collections::VecDeque,
    sync::Mutex,
};

use async_trait::async_trait;

use crate::backend::{
    BackendError, ChatCompletion, Classification, CompletionRequest, ModerationBackend,
    SynthesisRequest, SynthesizedRule,
};

/// Recorded call log entry, used by tests to assert which endpoints the
/// layers exercised and in what order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ClassifyText(String),
    ClassifyImage(String),
    CompleteChat { model: String },
    SynthesizeRule(String),
}

#[derive(Default)]
pub struct MockBackend {
    name: String,
    classifications: Mutex<VecDeque<Result<Classification, BackendError>>>,
    image_classifications: Mutex<VecDeque<Result<Classification, BackendError>>>,
    completions: Mutex<VecDeque<Result<ChatCompletion, BackendError>>>,
    syntheses: Mutex<VecDeque<Result<SynthesizedRule, BackendError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    last_completion_request: Mutex<Option<CompletionRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn push_classification(&self, result: Result<Classification, BackendError>) {
        self.classifications.lock().unwrap().push_back(result);
    }

    pub fn push_image_classification(&self, result: Result<Classification, BackendError>) {
        self.image_classifications.lock().unwrap().push_back(result);
    }

    pub fn push_completion(&self, result: Result<ChatCompletion, BackendError>) {
        self.completions.lock().unwrap().push_back(result);
    }

    pub fn push_synthesis(&self, result: Result<SynthesizedRule, BackendError>) {
        self.syntheses.lock().unwrap().push_back(result);
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_completion_request(&self) -> Option<CompletionRequest> {
        self.last_completion_request.lock().unwrap().clone()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ModerationBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify_text(&self, text: &str) -> Result<Classification, BackendError> {
        self.record(RecordedCall::ClassifyText(text.to_owned()));
        self.classifications
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Classification::default()))
    }

    async fn classify_image(&self, image: &str) -> Result<Classification, BackendError> {
        self.record(RecordedCall::ClassifyImage(image.to_owned()));
        self.image_classifications
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Classification::default()))
    }

    async fn complete_chat(
        &self,
        request: CompletionRequest,
    ) -> Result<ChatCompletion, BackendError> {
        self.record(RecordedCall::CompleteChat {
            model: request.model.clone(),
        });
        *self.last_completion_request.lock().unwrap() = Some(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ChatCompletion {
                    content: r#"{"violation":false,"category":"","severity":"","action":"none","reason":""}"#.to_owned(),
                    finish_reason: "stop".to_owned(),
                    total_tokens: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
            })
    }

    async fn synthesize_rule(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesizedRule, BackendError> {
        self.record(RecordedCall::SynthesizeRule(request.rule_text.clone()));
        self.syntheses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(SynthesizedRule {
                    rule_type: "contextual".to_owned(),
                    layer: "contextual".to_owned(),
                    category: Some("other".to_owned()),
                    regex: None,
                    priority: 10,
                })
            })
    }
}
