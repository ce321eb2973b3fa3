use std::time::Duration;

use futures_util::{stream, Stream};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::state::ChatMessage;
use crate::stream::{decode_line, LineDecoder, StreamChunk};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Total timeout for model listing and health checks.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout for chat requests. The chat client has no total timeout,
/// so a long generation is never cut off.
const CHAT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

enum ChatStreamState {
    Connecting(RequestBuilder),
    Reading {
        response: Response,
        lines: LineDecoder,
    },
    Done,
}

#[derive(Clone)]
pub struct OllamaClient {
    probe: Client,
    chat: Client,
    base_url: String,
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let probe = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(ChatError::ClientBuild)?;
        let chat = Client::builder()
            .connect_timeout(CHAT_CONNECT_TIMEOUT)
            .build()
            .map_err(ChatError::ClientBuild)?;

        Ok(Self {
            probe,
            chat,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Models installed on the server. Any failure yields an empty list.
    pub async fn list_models(&self) -> Vec<ModelDescriptor> {
        match self.fetch_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(base_url = %self.base_url, error = %e, "failed to list models");
                Vec::new()
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<ModelDescriptor>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.probe.get(&url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(ChatError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let models_response: OllamaModelsResponse = response.json().await?;
        tracing::debug!(count = models_response.models.len(), "listed models");
        Ok(models_response.models)
    }

    /// True iff the server answers the model listing with 200.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self.probe.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(base_url = %self.base_url, error = %e, "health check failed");
                false
            }
        }
    }

    /// Stream a chat reply.
    ///
    /// Nothing is sent until the stream is first polled. Connection failures
    /// and non-200 statuses come back as a single [`StreamChunk::Failed`].
    pub fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> impl Stream<Item = StreamChunk> + Send + 'static {
        let url = format!("{}/api/chat", self.base_url);

        let request = ChatRequest {
            model,
            messages,
            stream: true,
            options: ChatOptions { temperature },
        };
        tracing::debug!(%url, model, messages = messages.len(), temperature, "sending chat request");

        let builder = self.chat.post(&url).json(&request);

        stream::unfold(ChatStreamState::Connecting(builder), next_chunk)
    }
}

async fn next_chunk(mut state: ChatStreamState) -> Option<(StreamChunk, ChatStreamState)> {
    loop {
        match state {
            ChatStreamState::Connecting(builder) => match open_stream(builder).await {
                Ok(response) => {
                    state = ChatStreamState::Reading {
                        response,
                        lines: LineDecoder::new(),
                    };
                }
                Err(e) => return Some((StreamChunk::Failed(e.to_string()), ChatStreamState::Done)),
            },
            ChatStreamState::Reading {
                mut response,
                mut lines,
            } => {
                if let Some(line) = lines.next_line() {
                    let delta = decode_line(&line);
                    state = ChatStreamState::Reading { response, lines };
                    if let Some(delta) = delta {
                        return Some((StreamChunk::Delta(delta), state));
                    }
                    continue;
                }

                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        lines.push(&bytes);
                        state = ChatStreamState::Reading { response, lines };
                    }
                    Ok(None) => {
                        let tail = lines.finish().and_then(|line| decode_line(&line));
                        return tail.map(|delta| (StreamChunk::Delta(delta), ChatStreamState::Done));
                    }
                    Err(e) => {
                        let error = ChatError::Connection(e);
                        return Some((StreamChunk::Failed(error.to_string()), ChatStreamState::Done));
                    }
                }
            }
            ChatStreamState::Done => return None,
        }
    }
}

async fn open_stream(builder: RequestBuilder) -> Result<Response> {
    let response = builder.send().await?;

    if response.status() != StatusCode::OK {
        return Err(ChatError::HttpStatus {
            status: response.status().as_u16(),
        });
    }

    Ok(response)
}


#[cfg(test)]
mod tests {
    use super::test_server::{closed_port, serve_once, serve_with_length};
    use super::*;
    use crate::state::ChatRole;
    use futures_util::StreamExt;

    fn line(content: &str) -> String {
        format!(
            "{}\n",
            serde_json::json!({"model": "llama2", "message": {"role": "assistant", "content": content}, "done": false})
        )
    }

    #[tokio::test]
    async fn test_list_models_returns_names() {
        let body = r#"{"models":[{"name":"llama2:latest","size":1},{"name":"mistral:7b"}]}"#;
        let (base_url, server) = serve_once("200 OK", vec![body.to_string()]).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let models = client.list_models().await;

        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["llama2:latest", "mistral:7b"]);
        let request = server.await.unwrap();
        assert!(request.head.starts_with("GET /api/tags "));
    }

    #[tokio::test]
    async fn test_list_models_missing_field_is_empty() {
        let (base_url, _server) = serve_once("200 OK", vec!["{}".to_string()]).await;
        let client = OllamaClient::new(&base_url).unwrap();
        assert!(client.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_models_server_error_is_empty() {
        let (base_url, _server) = serve_once("500 Internal Server Error", vec!["oops".to_string()]).await;
        let client = OllamaClient::new(&base_url).unwrap();
        assert!(client.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_models_connection_error_is_empty() {
        let client = OllamaClient::new(&closed_port().await).unwrap();
        assert!(client.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_health() {
        let (base_url, _server) = serve_once("200 OK", vec![r#"{"models":[]}"#.to_string()]).await;
        assert!(OllamaClient::new(&base_url).unwrap().check_health().await);

        let (base_url, _server) = serve_once("404 Not Found", vec![String::new()]).await;
        assert!(!OllamaClient::new(&base_url).unwrap().check_health().await);

        let client = OllamaClient::new(&closed_port().await).unwrap();
        assert!(!client.check_health().await);
    }

    #[tokio::test]
    async fn test_chat_stream_yields_deltas_in_order() {
        let parts = vec![line("Hel"), line("lo"), line(", world")];
        let (base_url, _server) = serve_once("200 OK", parts).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let chunks: Vec<StreamChunk> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Delta("Hel".to_string()),
                StreamChunk::Delta("lo".to_string()),
                StreamChunk::Delta(", world".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_stream_skips_malformed_lines() {
        let parts = vec![
            line("a"),
            "{not json\n".to_string(),
            "\n".to_string(),
            line("b"),
            "{\"done\":true}\n".to_string(),
            line("c"),
        ];
        let (base_url, _server) = serve_once("200 OK", parts).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let texts: Vec<String> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .map(|chunk| chunk.text().to_string())
            .collect()
            .await;

        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_chat_stream_line_split_across_writes() {
        let full = line("split");
        let (head, tail) = full.split_at(12);
        let parts = vec![head.to_string(), tail.to_string()];
        let (base_url, _server) = serve_once("200 OK", parts).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let chunks: Vec<StreamChunk> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .collect()
            .await;

        assert_eq!(chunks, vec![StreamChunk::Delta("split".to_string())]);
    }

    #[tokio::test]
    async fn test_chat_stream_decodes_unterminated_last_line() {
        let last = line("end");
        let parts = vec![line("start"), last.trim_end().to_string()];
        let (base_url, _server) = serve_once("200 OK", parts).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let texts: Vec<String> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .map(|chunk| chunk.text().to_string())
            .collect()
            .await;

        assert_eq!(texts, vec!["start", "end"]);
    }

    #[tokio::test]
    async fn test_chat_stream_http_error() {
        let (base_url, _server) = serve_once("503 Service Unavailable", vec!["busy".to_string()]).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let chunks: Vec<StreamChunk> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .collect()
            .await;

        assert_eq!(chunks, vec![StreamChunk::Failed("Error: HTTP 503".to_string())]);
    }

    #[tokio::test]
    async fn test_chat_stream_connection_error() {
        let client = OllamaClient::new(&closed_port().await).unwrap();

        let chunks: Vec<StreamChunk> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_error());
        assert!(chunks[0].text().starts_with("Connection error: "));
    }

    #[tokio::test]
    async fn test_chat_stream_body_cut_short() {
        let (base_url, _server) = serve_with_length("200 OK", 1000, vec![line("par")]).await;
        let client = OllamaClient::new(&base_url).unwrap();

        let chunks: Vec<StreamChunk> = client
            .chat_stream("llama2", &[ChatMessage::user("hi")], 0.7)
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], StreamChunk::Delta("par".to_string()));
        assert!(chunks[1].is_error());
        assert!(chunks[1].text().starts_with("Connection error: "));
    }

    #[tokio::test]
    async fn test_chat_request_body() {
        let (base_url, server) = serve_once("200 OK", vec![line("ok")]).await;
        let client = OllamaClient::new(&base_url).unwrap();
        let history = vec![ChatMessage {
            role: ChatRole::User,
            content: "hi".to_string(),
        }];

        let _: Vec<StreamChunk> = client.chat_stream("llama2", &history, 0.7).collect().await;

        let request = server.await.unwrap();
        assert!(request.head.starts_with("POST /api/chat "));
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "llama2",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "options": {"temperature": 0.7}
            })
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/").unwrap();
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
    }
}
