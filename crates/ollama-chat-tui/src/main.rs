use anyhow::Result;
use ollama_chat_core::Config;

mod app;
mod handler;
mod logging;
mod tui;
mod ui;

use app::App;
use tui::{EventHandler, Tui};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging is best effort; the chat works without a log file
    let log_result = logging::init();

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });
    if let Err(e) = &log_result {
        eprintln!("warning: logging disabled: {e}");
    }

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = run(&mut terminal, &mut events, &config).await;

    tui::restore()?;
    result
}

async fn run(terminal: &mut Tui, events: &mut EventHandler, config: &Config) -> Result<()> {
    let mut app = App::new(config, events.sender())?;

    app.start_refresh();

    while !app.should_quit {
        terminal.draw(|frame| ui::render(&mut app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(&mut app, event).await?,
            None => break,
        }
    }

    // Quitting mid-reply drops the rest of the stream
    if let Some(task) = app.stream_task.take() {
        task.abort();
    }

    Ok(())
}
