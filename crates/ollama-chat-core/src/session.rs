//! One chat session: a client bound to a conversation.
//!
//! A turn is split in three so a UI can keep drawing while the reply streams:
//! [`ChatSession::begin_turn`] records the user message and snapshots the
//! request, [`PendingTurn::run`] streams without borrowing the session, and
//! [`ChatSession::finish_turn`] records the reply.

use crate::ai::ollama::{ModelDescriptor, OllamaClient};
use crate::error::{ChatError, Result};
use crate::state::{ChatMessage, ChatRole, SessionState};
use crate::stream::{AssembledReply, StreamAssembler};

#[derive(Debug)]
pub struct ChatSession {
    client: OllamaClient,
    state: SessionState,
    preferred_model: Option<String>,
}

/// Everything needed to stream one reply, detached from the session.
#[derive(Debug)]
pub struct PendingTurn {
    client: OllamaClient,
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

impl ChatSession {
    pub fn new(client: OllamaClient, state: SessionState) -> Self {
        Self {
            client,
            state,
            preferred_model: None,
        }
    }

    /// Model to pick on refresh when nothing usable is selected.
    pub fn with_preferred_model(mut self, model: Option<String>) -> Self {
        self.preferred_model = model;
        self
    }

    pub fn client(&self) -> &OllamaClient {
        &self.client
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// List models and make sure one is selected if any exist.
    pub async fn refresh_models(&mut self) -> Vec<ModelDescriptor> {
        let models = self.client.list_models().await;
        self.apply_models(&models);
        models
    }

    /// Reconcile the selection with a fresh model list.
    ///
    /// Keeps the current model while the server still has it. Otherwise picks
    /// the preferred model, else the first listed. An empty list leaves the
    /// selection alone.
    pub fn apply_models(&mut self, models: &[ModelDescriptor]) {
        if let Some(current) = self.state.selected_model() {
            if models.is_empty() || models.iter().any(|m| m.name == current) {
                return;
            }
            tracing::info!(model = %current, "selected model no longer available");
        }

        let preferred = self
            .preferred_model
            .as_deref()
            .and_then(|p| models.iter().find(|m| m.name == p))
            .or_else(|| models.first());

        match preferred {
            Some(model) => self.state.select_model(model.name.clone()),
            None => self.state.require_model(),
        }
    }

    pub fn begin_turn(&mut self, text: &str) -> Result<PendingTurn> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.state.is_streaming() {
            return Err(ChatError::TurnInProgress);
        }
        let Some(model) = self.state.selected_model().map(str::to_string) else {
            self.state.require_model();
            return Err(ChatError::NoModelSelected);
        };

        self.state.append_message(ChatRole::User, text);
        self.state.begin_streaming();

        Ok(PendingTurn {
            client: self.client.clone(),
            model,
            messages: self.state.messages().to_vec(),
            temperature: self.state.temperature(),
        })
    }

    pub fn finish_turn(&mut self, reply: AssembledReply) {
        self.state.append_message(ChatRole::Assistant, reply.content);
        self.state.end_streaming();
    }

    /// Run a whole turn, reporting the partial reply after each delta.
    pub async fn submit<F>(&mut self, text: &str, on_partial: F) -> Result<AssembledReply>
    where
        F: FnMut(&str),
    {
        let turn = self.begin_turn(text)?;
        let reply = turn.run(on_partial).await;
        self.finish_turn(reply.clone());
        Ok(reply)
    }
}

impl PendingTurn {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The history that will be sent, including the new user message.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub async fn run<F>(self, on_partial: F) -> AssembledReply
    where
        F: FnMut(&str),
    {
        let chunks = self
            .client
            .chat_stream(&self.model, &self.messages, self.temperature);
        StreamAssembler::drive(chunks, on_partial).await
    }
}
