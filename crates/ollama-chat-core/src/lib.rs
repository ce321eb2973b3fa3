pub mod ai;
pub mod config;
pub mod error;
pub mod session;
pub mod state;
pub mod stream;

// Re-export main types for convenience
pub use ai::{ModelDescriptor, OllamaClient};
pub use config::Config;
pub use error::ChatError;
pub use session::{ChatSession, PendingTurn};
pub use state::{ChatMessage, ChatRole, SessionChange, SessionState, TurnPhase};
pub use stream::{AssembledReply, StreamAssembler, StreamChunk};
