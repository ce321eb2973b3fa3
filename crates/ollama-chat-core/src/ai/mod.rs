pub mod ollama;

pub use ollama::{ModelDescriptor, OllamaClient};
