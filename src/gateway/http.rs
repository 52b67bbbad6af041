//! HTTP gateway
//!
//! `POST {base}/planning` returns one JSON document. `POST {base}/generating`
//! returns either NDJSON (one action descriptor per line, consumed as it
//! arrives) or a whole body holding `{"actions": [...]}` or a bare array.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info};

use super::{ActionStream, Gateway, GatewayRequest};
use crate::action::{ActionDescriptor, ExecutionStep};
use crate::config::GatewayConfig;
use crate::{Error, Result};

const API_KEY_ENV: &str = "NBFLOW_API_KEY";

/// Gateway speaking JSON over HTTP
pub struct HttpGateway {
    client: Client,
    planning_url: String,
    generating_url: String,
    stream: bool,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok());
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::Config(format!("Invalid API key: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout()?)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            planning_url: config.planning_url(),
            generating_url: config.generating_url(),
            stream: config.stream,
        })
    }

    async fn post(&self, url: &str, request: &GatewayRequest) -> Result<Response> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

/// 5xx and 429 are transient, any other non-success status is a rejection
fn status_error(status: StatusCode, body: &str) -> Error {
    let message = format!("Gateway returned {}: {}", status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Connectivity(message)
    } else {
        Error::Validation(message)
    }
}

/// One NDJSON line. Blank lines and SSE-style `data:` prefixes are tolerated.
fn parse_action_line(line: &str) -> Result<Option<ExecutionStep>> {
    let line = line.trim();
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() || line == "[DONE]" {
        return Ok(None);
    }
    let descriptor: ActionDescriptor = serde_json::from_str(line)
        .map_err(|e| Error::Validation(format!("Malformed action descriptor: {}", e)))?;
    ExecutionStep::from_descriptor(descriptor).map(Some)
}

/// Split every complete line off the front of `buffer`
fn take_lines(buffer: &mut Vec<u8>) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(decode_line(raw)?);
    }
    Ok(lines)
}

fn decode_line(raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw)
        .map_err(|e| Error::Validation(format!("Action stream is not UTF-8: {}", e)))
}

/// A body cut short (timeout, reset) is a connectivity failure. A complete
/// body that is not JSON is a rejection.
async fn read_json(response: Response, what: &str) -> Result<Value> {
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Connectivity(format!("Reading {} response failed: {}", what, e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("{} response is not JSON: {}", what, e)))
}

/// Whole-body generating response
fn parse_action_body(body: Value) -> Result<Vec<ExecutionStep>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("actions") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::Validation(
                    "Generating response has no 'actions' list".to_string(),
                ))
            }
        },
        other => {
            return Err(Error::Validation(format!(
                "Unexpected generating response: {}",
                other
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            let descriptor: ActionDescriptor = serde_json::from_value(item)
                .map_err(|e| Error::Validation(format!("Malformed action descriptor: {}", e)))?;
            ExecutionStep::from_descriptor(descriptor)
        })
        .collect()
}

/// Streamed unless the server answered with a plain JSON document
fn is_ndjson(response: &Response, requested: bool) -> bool {
    match response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(ct) if ct.contains("ndjson") || ct.contains("event-stream") => true,
        Some(ct) if ct.contains("application/json") => false,
        _ => requested,
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn plan(&self, request: &GatewayRequest) -> Result<Value> {
        debug!("Planning call: {}", request.kind);
        let response = self.post(&self.planning_url, request).await?;
        read_json(response, "Planning").await
    }

    async fn generate(&self, request: &GatewayRequest) -> Result<ActionStream> {
        let mut request = request.clone();
        request.stream = self.stream;
        let response = self.post(&self.generating_url, &request).await?;

        if !is_ndjson(&response, self.stream) {
            let body = read_json(response, "Generating").await?;
            let steps = parse_action_body(body)?;
            info!("Received {} actions", steps.len());
            return Ok(futures::stream::iter(steps.into_iter().map(Ok)).boxed());
        }

        info!("Streaming actions from {}", self.generating_url);
        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            // Raw bytes: a character may be split across chunks
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| Error::Connectivity(format!("Action stream broke: {}", e)))?;
                buffer.extend_from_slice(&chunk);

                for line in take_lines(&mut buffer)? {
                    if let Some(step) = parse_action_line(&line)? {
                        yield step;
                    }
                }
            }

            let rest = decode_line(std::mem::take(&mut buffer))?;
            if let Some(step) = parse_action_line(&rest)? {
                yield step;
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{RequestKind, RetryPolicy};
    use crate::workflow::{WorkflowSession, WorkflowState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local server answering every connection with the given writes,
    /// pausing between them, then holding the socket open
    async fn serve(parts: Vec<Vec<u8>>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let parts = parts.clone();
                tokio::spawn(async move {
                    let mut request = vec![0u8; 16 * 1024];
                    let _ = socket.read(&mut request).await;
                    for part in parts {
                        if socket.write_all(&part).await.is_err() {
                            return;
                        }
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        (format!("http://{}", addr), connections)
    }

    fn chunk(data: &[u8]) -> Vec<u8> {
        let mut out = format!("{:x}\r\n", data.len()).into_bytes();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn request(kind: RequestKind) -> GatewayRequest {
        GatewayRequest::build(kind, &WorkflowSession::new(), WorkflowState::Idle, None, false)
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            Error::Connectivity(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            Error::Connectivity(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad plan"),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_ndjson_lines() {
        let step = parse_action_line(
            r#"{"action_type":"add-cell","sequence_number":1,"payload":{"content":"hi"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(step.action_type, "add-cell");
        assert_eq!(step.content.as_deref(), Some("hi"));

        assert!(parse_action_line("   ").unwrap().is_none());
        assert!(parse_action_line("data: [DONE]").unwrap().is_none());
        assert!(parse_action_line("data: {\"action\":\"new-chapter\"}")
            .unwrap()
            .is_some());
        assert!(matches!(
            parse_action_line("{not json"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_lines_split_inside_a_character() {
        let line = "{\"action_type\":\"add-text\",\"payload\":\"café\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = line[..split].to_vec();
        assert!(take_lines(&mut buffer).unwrap().is_empty());
        buffer.extend_from_slice(&line[split..]);
        let lines = take_lines(&mut buffer).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(buffer.is_empty());

        let step = parse_action_line(&lines[0]).unwrap().unwrap();
        assert_eq!(step.content.as_deref(), Some("café"));

        let mut bad = vec![b'{', 0xFF, b'}', b'\n'];
        assert!(matches!(take_lines(&mut bad), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_streamed_character_split_across_chunks() {
        let line = "{\"action_type\":\"add-text\",\"payload\":\"café\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let (base_url, _) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n"
                .to_vec(),
            chunk(&line[..split]),
            chunk(&line[split..]),
            b"0\r\n\r\n".to_vec(),
        ])
        .await;

        let gateway = HttpGateway::new(&GatewayConfig {
            base_url,
            ..GatewayConfig::default()
        })
        .unwrap();
        let steps: Vec<_> = gateway
            .generate(&request(RequestKind::ActionGeneration))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(steps.len(), 1);
        let step = steps[0].as_ref().unwrap();
        assert_eq!(step.content.as_deref(), Some("café"));
    }

    #[tokio::test]
    async fn test_stalled_body_is_retried() {
        let (base_url, connections) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"stages\":"
                .to_vec(),
        ])
        .await;

        let gateway = HttpGateway::new(&GatewayConfig {
            base_url,
            timeout: "300ms".to_string(),
            ..GatewayConfig::default()
        })
        .unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let request = request(RequestKind::StageGeneration);

        let result = policy.run("Planning", || gateway.plan(&request)).await;
        assert!(
            matches!(result, Err(Error::ConnectivityExhausted { attempts: 3, .. })),
            "{:?}",
            result
        );
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_complete_non_json_body_is_rejected() {
        let (base_url, connections) = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot json!"
                .to_vec(),
        ])
        .await;

        let gateway = HttpGateway::new(&GatewayConfig {
            base_url,
            ..GatewayConfig::default()
        })
        .unwrap();
        let request = request(RequestKind::StageGeneration);

        let result = RetryPolicy::default()
            .run("Planning", || gateway.plan(&request))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))), "{:?}", result);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_whole_body() {
        let steps = parse_action_body(json!({"actions": [
            {"action_type": "add-cell", "payload": "a"},
            {"action_type": "execute-code", "payload": {"target": "last-added-cell"}}
        ]}))
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].target.as_deref(), Some("last-added-cell"));

        let bare = parse_action_body(json!([{"type": "new-section", "payload": "B"}])).unwrap();
        assert_eq!(bare[0].action_type, "new-section");

        assert!(parse_action_body(json!({"steps": []})).is_err());
    }

    #[test]
    fn test_new_from_config() {
        let config = GatewayConfig {
            api_key: Some("secret".into()),
            ..GatewayConfig::default()
        };
        let gateway = HttpGateway::new(&config).unwrap();
        assert_eq!(gateway.planning_url, "http://127.0.0.1:8000/planning");
        assert!(gateway.stream);
    }
}
