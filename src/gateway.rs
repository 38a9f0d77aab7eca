//! Prompt construction and answer parsing around a [`CompletionService`].
//!
//! The gateway makes exactly one completion call per admitted request,
//! bounded by the configured timeout. Failures are never retried here.
//! The reply must be a JSON object with `explanation`, `example`, and
//! `examTip`, optionally wrapped in a Markdown code fence; anything else is
//! reported as [`GateError::MalformedUpstream`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::completion::{ChatCompletionRequest, ChatMessage, CompletionService};
use crate::config::UpstreamSettings;
use crate::validation::ValidatedDoubt;
use crate::{GateError, Result};

/// System instruction sent with every completion.
pub const SYSTEM_INSTRUCTION: &str = "You are an experienced, patient tutor who helps students \
     understand their doubts. You always answer with a single valid JSON object and nothing else.";

/// Matches a reply wrapped in a Markdown code fence, with an optional
/// language tag, capturing the fenced content.
static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\s*```$")
        .expect("code fence pattern must compile")
});

/// The structured answer returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubtAnswer {
    /// Step-by-step explanation of the concept.
    pub explanation: String,
    /// One worked example.
    pub example: String,
    /// A tip aimed at answering this kind of question in an exam.
    pub exam_tip: String,
}

/// Builds the user prompt for a validated doubt.
pub fn build_prompt(doubt: &ValidatedDoubt) -> String {
    format!(
        "A {level} student studying {subject} asked:\n\
         \"{question}\"\n\n\
         Respond with a JSON object containing exactly these three string fields:\n\
         - \"explanation\": a clear, step-by-step explanation suited to a {level} student\n\
         - \"example\": one concrete example that illustrates the explanation\n\
         - \"examTip\": one practical tip for answering this kind of question in an exam\n\n\
         Return only the JSON object, with no code fences, headings, or commentary.",
        level = doubt.level,
        subject = doubt.subject,
        question = doubt.question,
    )
}

/// Removes a surrounding Markdown code fence, if any, and trims whitespace.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    CODE_FENCE
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map_or(trimmed, |inner| inner.as_str().trim())
}

/// Parses a completion reply into a [`DoubtAnswer`].
pub fn parse_answer(reply: &str) -> Result<DoubtAnswer> {
    serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| GateError::MalformedUpstream(format!("reply is not a valid answer: {e}")))
}

/// Turns validated doubts into answers through a [`CompletionService`].
#[derive(Debug, Clone)]
pub struct CompletionGateway {
    service: Arc<dyn CompletionService>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl CompletionGateway {
    /// Creates a gateway calling `service` with the given settings.
    pub fn new(service: Arc<dyn CompletionService>, settings: &UpstreamSettings) -> Self {
        Self {
            service,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            timeout: settings.timeout,
        }
    }

    /// Builds the completion request for `doubt`.
    pub fn build_request(&self, doubt: &ValidatedDoubt) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(SYSTEM_INSTRUCTION),
                ChatMessage::user(build_prompt(doubt)),
            ],
            temperature: self.temperature,
            max_tokens: Some(self.max_tokens),
        }
    }

    /// Asks the completion service about `doubt` and parses its reply.
    ///
    /// Dropping the returned future cancels the outstanding call.
    pub async fn solve(&self, doubt: &ValidatedDoubt) -> Result<DoubtAnswer> {
        let request = self.build_request(doubt);
        let start = Instant::now();

        let reply = match timeout(self.timeout, self.service.complete(&request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    latency_ms = start.elapsed().as_millis() as u64,
                    model = %self.model,
                    "completion call failed"
                );
                return Err(e);
            }
            Err(_elapsed) => {
                warn!(
                    timeout = ?self.timeout,
                    model = %self.model,
                    "completion call timed out"
                );
                return Err(GateError::UpstreamTimeout(self.timeout));
            }
        };

        info!(
            latency_ms = start.elapsed().as_millis() as u64,
            model = %self.model,
            reply_len = reply.len(),
            "completion received"
        );

        parse_answer(&reply).inspect_err(|e| {
            warn!(error = %e, "completion reply could not be parsed");
            debug!(reply = %reply, "unparseable completion reply");
        })
    }
}
