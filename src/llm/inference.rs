//! The inference collaborator used by the triage pipeline.
//!
//! `InferenceClient` is the boundary the summarizer, classifier and drafter
//! call. It does no retrying of its own; timeouts and backoff belong to the
//! caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::InferenceError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::taxonomy::{Intent, Taxonomy};
use crate::pipeline::types::{RawModelSignal, ReplyVariant};

/// Input for one drafting call.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftRequest {
    pub subject: String,
    pub text: String,
    pub intent: Intent,
    pub language: String,
    /// Variants wanted from this call.
    pub variants: Vec<ReplyVariant>,
}

/// Drafted texts, keyed by variant. `None` means not produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftReplies {
    pub formal: Option<String>,
    pub friendly: Option<String>,
}

impl DraftReplies {
    pub fn get(&self, variant: ReplyVariant) -> Option<&str> {
        match variant {
            ReplyVariant::Formal => self.formal.as_deref(),
            ReplyVariant::Friendly => self.friendly.as_deref(),
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Suggest an intent label with optional certainty and sentiment.
    async fn classify_and_score(
        &self,
        text: &str,
        language: &str,
    ) -> Result<RawModelSignal, InferenceError>;

    /// Draft the requested reply variants.
    async fn draft_replies(&self, request: &DraftRequest) -> Result<DraftReplies, InferenceError>;

    /// A short executive briefing of the email, written in `language`.
    async fn summarize(&self, text: &str, language: &str) -> Result<String, InferenceError>;
}

/// `InferenceClient` backed by a chat-completion provider.
pub struct LlmInference {
    llm: Arc<dyn LlmProvider>,
    labels: Vec<&'static str>,
}

impl LlmInference {
    pub fn new(llm: Arc<dyn LlmProvider>, taxonomy: &Taxonomy) -> Self {
        Self {
            llm,
            labels: taxonomy.prompt_labels(),
        }
    }

    fn classify_prompt(&self, language: &str) -> String {
        format!(
            "You triage business email for an executive team. Pick the single best intent \
             for the email from this list:\n{labels}\n\n\
             The email is written in language '{language}'.\n\
             Respond with JSON only:\n\
             {{\"intent\": \"<one label from the list>\", \
             \"certainty\": <0.0-1.0>, \
             \"sentiment\": \"positive|neutral|negative|urgent|opportunity\"}}",
            labels = self.labels.join("\n"),
        )
    }

    fn summary_prompt(language: &str) -> String {
        format!(
            "Write an executive summary of the email below for C-level review. \
             Write it in language '{language}', in 2 to 4 sentences. Focus on business \
             impact, decisions needed, opportunities and risks. Respond with the summary \
             text only."
        )
    }

    fn draft_prompt(request: &DraftRequest) -> String {
        let keys: Vec<String> = request
            .variants
            .iter()
            .map(|v| format!("\"{}\": \"<reply>\"", v.as_str()))
            .collect();
        format!(
            "You write reply drafts for an executive assistant. The email below was \
             classified as {intent}. Write the reply in language '{language}'.\n\
             - formal: professional, concise, results-oriented.\n\
             - friendly: warm, relationship-building, still professional.\n\
             Do not invent commitments, prices or dates.\n\
             Respond with JSON only: {{{keys}}}",
            intent = request.intent,
            language = request.language,
            keys = keys.join(", "),
        )
    }

    async fn complete(
        &self,
        call: &'static str,
        system: String,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, InferenceError> {
        let request = CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_max_tokens(max_tokens)
            .with_temperature(temperature);

        let response = self.llm.complete(request).await?;
        tracing::debug!(
            call,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %self.llm.estimate_cost(&response),
            "Inference call completed"
        );
        Ok(response.content)
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyReply {
    intent: Option<String>,
    #[serde(default)]
    certainty: Option<serde_json::Value>,
    #[serde(default)]
    sentiment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DraftReply {
    #[serde(default)]
    formal: Option<String>,
    #[serde(default)]
    friendly: Option<String>,
}

#[async_trait]
impl InferenceClient for LlmInference {
    async fn classify_and_score(
        &self,
        text: &str,
        language: &str,
    ) -> Result<RawModelSignal, InferenceError> {
        let content = self
            .complete("classify", self.classify_prompt(language), text.to_string(), 120, 0.2)
            .await?;
        parse_classify_reply(&content)
    }

    async fn draft_replies(&self, request: &DraftRequest) -> Result<DraftReplies, InferenceError> {
        let user = format!("Subject: {}\n\n{}", request.subject, request.text);
        let content = self
            .complete("draft", Self::draft_prompt(request), user, 900, 0.4)
            .await?;
        parse_draft_reply(&content, &request.variants)
    }

    async fn summarize(&self, text: &str, language: &str) -> Result<String, InferenceError> {
        let content = self
            .complete("summarize", Self::summary_prompt(language), text.to_string(), 200, 0.3)
            .await?;
        let summary = content.trim();
        if summary.is_empty() {
            return Err(InferenceError::Malformed("empty summary".into()));
        }
        Ok(summary.to_string())
    }
}

fn parse_classify_reply(content: &str) -> Result<RawModelSignal, InferenceError> {
    let reply: ClassifyReply = serde_json::from_str(&extract_json_object(content))
        .map_err(|e| InferenceError::Malformed(format!("classification reply: {e}")))?;

    let intent_label = reply
        .intent
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| InferenceError::Malformed("classification reply has no intent".into()))?;

    // Numbers may come back as strings ("0.8", "85%").
    let certainty = reply.certainty.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    });

    Ok(RawModelSignal {
        intent_label,
        certainty,
        sentiment: reply.sentiment.filter(|s| !s.trim().is_empty()),
    })
}

fn parse_draft_reply(
    content: &str,
    variants: &[ReplyVariant],
) -> Result<DraftReplies, InferenceError> {
    let reply: DraftReply = serde_json::from_str(&extract_json_object(content))
        .map_err(|e| InferenceError::Malformed(format!("draft reply: {e}")))?;

    let keep = |variant: ReplyVariant, text: Option<String>| {
        text.map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && variants.contains(&variant))
    };

    Ok(DraftReplies {
        formal: keep(ReplyVariant::Formal, reply.formal),
        friendly: keep(ReplyVariant::Friendly, reply.friendly),
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
