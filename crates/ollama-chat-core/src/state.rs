//! UI-agnostic session state
//!
//! Holds the conversation for one user session and notifies listeners after
//! every mutation, so a UI can re-render without polling.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;

/// A chat message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Where the session is in the lifecycle of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    AwaitingModel,
    Ready,
    Streaming,
}

/// What changed, passed to every listener after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    MessageAppended { index: usize, role: ChatRole },
    ModelSelected(String),
    TemperatureChanged(f64),
    Cleared,
}

pub type ChangeListener = Box<dyn Fn(&SessionChange) + Send + Sync>;

pub struct SessionState {
    messages: Vec<ChatMessage>,
    selected_model: Option<String>,
    temperature: f64,
    phase: TurnPhase,
    listeners: Vec<ChangeListener>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("messages", &self.messages.len())
            .field("selected_model", &self.selected_model)
            .field("temperature", &self.temperature)
            .field("phase", &self.phase)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            selected_model: None,
            temperature: DEFAULT_TEMPERATURE,
            phase: TurnPhase::Idle,
            listeners: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = clamp_temperature(temperature).unwrap_or(DEFAULT_TEMPERATURE);
        self
    }

    /// Register a listener invoked after every append, model selection,
    /// temperature change and clear.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&SessionChange) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == TurnPhase::Streaming
    }

    pub fn append_message(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
        let index = self.messages.len() - 1;
        self.notify(SessionChange::MessageAppended { index, role });
    }

    pub fn select_model(&mut self, name: impl Into<String>) {
        let name = name.into();
        tracing::info!(model = %name, "model selected");
        self.selected_model = Some(name.clone());
        if matches!(self.phase, TurnPhase::Idle | TurnPhase::AwaitingModel) {
            self.phase = TurnPhase::Ready;
        }
        self.notify(SessionChange::ModelSelected(name));
    }

    /// Values outside [0.0, 2.0] are clamped; NaN is ignored.
    pub fn set_temperature(&mut self, value: f64) {
        if let Some(value) = clamp_temperature(value) {
            self.temperature = value;
            self.notify(SessionChange::TemperatureChanged(value));
        }
    }

    /// Empty the history. Model selection and temperature are kept.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.notify(SessionChange::Cleared);
    }

    /// Models were listed and none could be chosen.
    pub fn require_model(&mut self) {
        if self.selected_model.is_none() && self.phase == TurnPhase::Idle {
            self.phase = TurnPhase::AwaitingModel;
        }
    }

    pub(crate) fn begin_streaming(&mut self) {
        self.phase = TurnPhase::Streaming;
    }

    pub(crate) fn end_streaming(&mut self) {
        if self.phase == TurnPhase::Streaming {
            self.phase = if self.selected_model.is_some() {
                TurnPhase::Ready
            } else {
                TurnPhase::AwaitingModel
            };
        }
    }

    fn notify(&self, change: SessionChange) {
        for listener in &self.listeners {
            listener(&change);
        }
    }
}

fn clamp_temperature(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE))
    }
}
