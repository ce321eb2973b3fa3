use ratatui::widgets::ListState;
use ollama_chat_core::{
    AssembledReply, ChatSession, Config, ModelDescriptor, OllamaClient, SessionChange,
    SessionState,
};
use crate::tui::{AppEvent, EventSender};

const TEMPERATURE_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub status: Option<String>,

    // Chat state
    pub session: ChatSession,
    pub input: String,
    pub input_cursor: usize, // cursor position in input (chars)
    pub partial_reply: Option<String>,
    pub stream_task: Option<tokio::task::JoinHandle<()>>,
    pub chat_scroll: u16,
    pub chat_height: u16, // Height of chat area for scroll calculations
    pub chat_width: u16,  // Width of chat area for wrap calculations

    // Connection state
    pub connected: bool,
    pub models_loaded: bool,
    pub refreshing: bool,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Model picker state
    pub show_model_picker: bool,
    pub available_models: Vec<String>,
    pub model_picker_state: ListState,

    events: EventSender,
}

impl App {
    pub fn new(config: &Config, events: EventSender) -> anyhow::Result<Self> {
        let client = OllamaClient::new(&config.base_url)?;

        let mut state = SessionState::new().with_temperature(config.temperature);
        let session_events = events.clone();
        state.subscribe(move |change| {
            let _ = session_events.send(AppEvent::Session(change.clone()));
        });

        let session = ChatSession::new(client, state)
            .with_preferred_model(config.default_model.clone());

        Ok(Self {
            should_quit: false,
            input_mode: InputMode::Normal,
            status: None,

            session,
            input: String::new(),
            input_cursor: 0,
            partial_reply: None,
            stream_task: None,
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,

            connected: false,
            models_loaded: false,
            refreshing: false,

            animation_frame: 0,

            show_model_picker: false,
            available_models: Vec::new(),
            model_picker_state: ListState::default(),

            events,
        })
    }

    pub fn base_url(&self) -> &str {
        self.session.client().base_url()
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.session.state().selected_model()
    }

    pub fn temperature(&self) -> f64 {
        self.session.state().temperature()
    }

    pub fn is_streaming(&self) -> bool {
        self.session.state().is_streaming()
    }

    /// Chat is blocked until the server is up and has at least one model.
    pub fn can_chat(&self) -> bool {
        self.connected && !self.available_models.is_empty() && self.selected_model().is_some()
    }

    /// Check the server and reload the model list in the background.
    /// The result arrives as [`AppEvent::Refreshed`].
    pub fn start_refresh(&mut self) {
        if self.refreshing {
            return;
        }
        self.refreshing = true;
        self.status = Some("Checking connection...".to_string());

        let client = self.session.client().clone();
        let tx = self.events.clone();
        tokio::spawn(async move {
            let connected = client.check_health().await;
            let models = if connected {
                client.list_models().await
            } else {
                Vec::new()
            };
            let _ = tx.send(AppEvent::Refreshed { connected, models });
        });
    }

    pub fn on_refreshed(&mut self, connected: bool, models: Vec<ModelDescriptor>) {
        self.refreshing = false;
        self.connected = connected;
        self.models_loaded = true;

        if connected {
            self.session.apply_models(&models);
            self.available_models = models.into_iter().map(|m| m.name).collect();
            self.status = Some(format!("{} models available", self.available_models.len()));
        } else {
            tracing::warn!(base_url = %self.base_url(), "cannot connect to Ollama");
            self.available_models.clear();
            self.session.state_mut().require_model();
            self.status = None;
        }
    }

    /// Send the input as a user message and start streaming the reply.
    pub fn submit_input(&mut self) {
        if !self.can_chat() {
            self.status = Some("Select a model before chatting".to_string());
            return;
        }

        let turn = match self.session.begin_turn(&self.input) {
            Ok(turn) => turn,
            Err(e) => {
                self.status = Some(e.to_string());
                return;
            }
        };

        self.input.clear();
        self.input_cursor = 0;
        self.status = None;
        self.partial_reply = None;
        self.input_mode = InputMode::Normal;

        let tx = self.events.clone();
        self.stream_task = Some(tokio::spawn(async move {
            let partial_tx = tx.clone();
            let reply = turn
                .run(move |partial| {
                    let _ = partial_tx.send(AppEvent::Partial(partial.to_string()));
                })
                .await;
            let _ = tx.send(AppEvent::Reply(reply));
        }));

        // Scroll to bottom so "Thinking..." is visible
        self.scroll_chat_to_bottom();
    }

    pub fn on_partial(&mut self, partial: String) {
        if self.is_streaming() {
            self.partial_reply = Some(partial);
            self.scroll_chat_to_bottom();
        }
    }

    pub fn on_reply(&mut self, reply: AssembledReply) {
        self.partial_reply = None;
        self.stream_task = None;
        self.session.finish_turn(reply);
    }

    pub fn on_session_change(&mut self, change: SessionChange) {
        match change {
            SessionChange::MessageAppended { .. } => self.scroll_chat_to_bottom(),
            SessionChange::Cleared => {
                self.chat_scroll = 0;
                self.status = Some("Chat cleared".to_string());
            }
            SessionChange::ModelSelected(name) => {
                self.status = Some(format!("Using {}", name));
            }
            SessionChange::TemperatureChanged(_) => {}
        }
    }

    pub fn clear_chat(&mut self) {
        if self.is_streaming() {
            self.status = Some("Wait for the reply to finish".to_string());
            return;
        }
        self.session.state_mut().clear();
    }

    pub fn temperature_up(&mut self) {
        let next = (self.temperature() / TEMPERATURE_STEP).round() * TEMPERATURE_STEP + TEMPERATURE_STEP;
        self.session.state_mut().set_temperature(round_tenth(next));
    }

    pub fn temperature_down(&mut self) {
        let next = (self.temperature() / TEMPERATURE_STEP).round() * TEMPERATURE_STEP - TEMPERATURE_STEP;
        self.session.state_mut().set_temperature(round_tenth(next));
    }

    pub fn scroll_down(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_add(1);
    }

    pub fn scroll_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.is_streaming() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Scroll chat so the newest line is visible
    pub fn scroll_chat_to_bottom(&mut self) {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total_lines: u16 = 0;

        let mut count_block = |content: &str| {
            total_lines = total_lines.saturating_add(1); // Role line
            for line in content.lines() {
                // Use character count, not byte length, for proper UTF-8 handling
                let char_count = line.chars().count();
                let wrapped = if char_count == 0 { 1 } else { (char_count / wrap_width) + 1 };
                total_lines = total_lines.saturating_add(wrapped as u16);
            }
            total_lines = total_lines.saturating_add(1); // Blank line after message
        };

        for msg in self.session.state().messages() {
            count_block(&msg.content);
        }

        if self.is_streaming() {
            match self.partial_reply.as_deref() {
                Some(partial) => count_block(partial),
                None => count_block("Thinking..."),
            }
        }

        let visible_height = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };

        self.chat_scroll = total_lines.saturating_sub(visible_height);
    }

    // Model picker methods
    pub fn open_model_picker(&mut self) {
        if self.available_models.is_empty() {
            self.status = Some("No models available".to_string());
            return;
        }
        // Select current model if in list, otherwise first
        let current_idx = self
            .selected_model()
            .and_then(|selected| self.available_models.iter().position(|m| m == selected))
            .unwrap_or(0);
        self.model_picker_state.select(Some(current_idx));
        self.show_model_picker = true;
    }

    pub fn model_picker_nav_down(&mut self) {
        let len = self.available_models.len();
        if len > 0 {
            let i = self.model_picker_state.selected().unwrap_or(0);
            self.model_picker_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn model_picker_nav_up(&mut self) {
        let i = self.model_picker_state.selected().unwrap_or(0);
        self.model_picker_state.select(Some(i.saturating_sub(1)));
    }

    pub fn select_model(&mut self) {
        if let Some(i) = self.model_picker_state.selected() {
            if let Some(model) = self.available_models.get(i).cloned() {
                if self.selected_model() != Some(model.as_str()) {
                    self.session.state_mut().select_model(model);
                }
                self.show_model_picker = false;
            }
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ollama_chat_core::{ChatRole, TurnPhase};
    use tokio::sync::mpsc;

    fn app() -> (App, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = App::new(&Config::default(), tx).unwrap();
        (app, rx)
    }

    #[test]
    fn test_temperature_steps_and_clamps() {
        let (mut app, _rx) = app();
        assert_eq!(app.temperature(), 0.7);

        app.temperature_up();
        assert_eq!(app.temperature(), 0.8);

        for _ in 0..30 {
            app.temperature_up();
        }
        assert_eq!(app.temperature(), 2.0);

        for _ in 0..30 {
            app.temperature_down();
        }
        assert_eq!(app.temperature(), 0.0);
    }

    #[test]
    fn test_session_changes_reach_event_channel() {
        let (mut app, mut rx) = app();

        app.session.state_mut().append_message(ChatRole::User, "hi");
        app.clear_chat();

        match rx.try_recv().unwrap() {
            AppEvent::Session(SessionChange::MessageAppended { index: 0, .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            AppEvent::Session(SessionChange::Cleared) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_submit_blocked_without_models() {
        let (mut app, _rx) = app();
        app.input = "hello".to_string();

        app.submit_input();

        assert!(app.session.state().messages().is_empty());
        assert_eq!(app.input, "hello");
        assert!(app.status.is_some());
    }

    #[test]
    fn test_model_picker_selects_model() {
        let (mut app, _rx) = app();
        app.available_models = vec!["llama2".to_string(), "mistral".to_string()];

        app.open_model_picker();
        assert!(app.show_model_picker);
        app.model_picker_nav_down();
        app.model_picker_nav_down();
        app.select_model();

        assert!(!app.show_model_picker);
        assert_eq!(app.selected_model(), Some("mistral"));
        assert_eq!(app.session.state().phase(), TurnPhase::Ready);
    }

    #[test]
    fn test_reply_is_recorded() {
        let (mut app, _rx) = app();
        app.connected = true;
        app.available_models = vec!["llama2".to_string()];
        app.session.state_mut().select_model("llama2");
        let _turn = app.session.begin_turn("hi").unwrap();

        app.on_partial("Hel▌".to_string());
        assert_eq!(app.partial_reply.as_deref(), Some("Hel▌"));

        app.on_reply(AssembledReply {
            content: "Hello".to_string(),
            errored: false,
        });

        assert!(app.partial_reply.is_none());
        assert!(!app.is_streaming());
        assert_eq!(app.session.state().messages()[1].content, "Hello");
    }

    #[test]
    fn test_refresh_result_updates_models() {
        let (mut app, _rx) = app();
        app.refreshing = true;

        app.on_refreshed(
            true,
            vec![
                ModelDescriptor { name: "llama2".to_string() },
                ModelDescriptor { name: "mistral".to_string() },
            ],
        );

        assert!(!app.refreshing);
        assert!(app.models_loaded);
        assert!(app.can_chat());
        assert_eq!(app.available_models, vec!["llama2", "mistral"]);
        assert_eq!(app.selected_model(), Some("llama2"));

        app.on_refreshed(false, Vec::new());

        assert!(!app.connected);
        assert!(app.available_models.is_empty());
        assert!(!app.can_chat());
    }

    #[tokio::test]
    async fn test_refresh_does_not_block_streaming() {
        let (mut app, mut rx) = app();
        app.connected = true;
        app.available_models = vec!["llama2".to_string()];
        app.session.state_mut().select_model("llama2");
        let _turn = app.session.begin_turn("hi").unwrap();

        app.start_refresh();
        app.start_refresh();
        assert!(app.refreshing);

        // Partials still apply while the check runs
        app.on_partial("Hel▌".to_string());
        assert_eq!(app.partial_reply.as_deref(), Some("Hel▌"));

        loop {
            match rx.recv().await {
                Some(AppEvent::Refreshed { connected, models }) => {
                    app.on_refreshed(connected, models);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        assert!(!app.refreshing);
        assert!(app.is_streaming());
    }

    #[test]
    fn test_scroll_to_bottom_counts_wrapped_lines() {
        let (mut app, _rx) = app();
        app.chat_width = 10;
        app.chat_height = 5;
        // Role line + 3 wrapped lines + blank line
        app.session.state_mut().append_message(ChatRole::Assistant, "x".repeat(25));

        app.scroll_chat_to_bottom();

        assert_eq!(app.chat_scroll, 0);

        app.session.state_mut().append_message(ChatRole::User, "short");
        app.scroll_chat_to_bottom();

        assert_eq!(app.chat_scroll, 3);
    }
}
