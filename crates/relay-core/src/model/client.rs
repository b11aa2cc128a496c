use async_trait::async_trait;

use crate::Result;

use super::types::{ChatTurn, Sampling};

/// Text-generation port.
///
/// Adapters only move a prepared message list over the wire; prompt
/// construction lives in [`super::prompts`] so every provider gets the same
/// instructions. Errors surface as `Error::External` and callers fall back
/// locally.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one chat completion and return the assistant text.
    async fn chat(&self, messages: Vec<ChatTurn>, sampling: Sampling) -> Result<String>;

    /// Conversational reply: system prompt, prior turns, then the new user text.
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_text: &str,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(super::prompts::system_turn(system_prompt));
        messages.extend(history.iter().cloned());
        messages.push(ChatTurn::user(user_text));
        self.chat(messages, Sampling::REPLY).await
    }

    /// Free-form behavioral summary of a transcript.
    async fn summarize(&self, subject: &str, transcript: &str) -> Result<String> {
        let messages = vec![
            super::prompts::system_turn(&super::prompts::analysis_prompt(subject)),
            ChatTurn::user(transcript),
        ];
        self.chat(messages, Sampling::ANALYSIS).await
    }

    /// `Ok(None)` when no problem was detected, otherwise the raw verdict.
    async fn classify_problem(&self, subject: &str, transcript: &str) -> Result<Option<String>> {
        let messages = vec![
            super::prompts::system_turn(&super::prompts::problem_prompt(subject)),
            ChatTurn::user(transcript),
        ];
        let raw = self.chat(messages, Sampling::CLASSIFY).await?;
        Ok(super::prompts::parse_problem_response(&raw))
    }
}
