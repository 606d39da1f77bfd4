//! STOMP 1.2 over WebSocket.
//!
//! One STOMP frame per WebSocket text message. The server may interleave
//! bare EOLs as heart-beats; those are skipped by the decoder.

use crate::client::error::{LinkError, TransportError};
use crate::client::realtime::transport::{InboundFrame, Transport, TransportLink};
use crate::shared::Topic;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// CONNECT and CONNECTED frames carry raw header values.
    fn escapes_headers(command: &str) -> bool {
        !matches!(command, "CONNECT" | "CONNECTED")
    }

    pub fn encode(&self) -> String {
        let escape = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame. Returns `Ok(None)` for heart-beats.
    pub fn decode(input: &str) -> Result<Option<Self>, TransportError> {
        let input = input.trim_start_matches(['\r', '\n']);
        if input.is_empty() || input == "\0" {
            return Ok(None);
        }

        let (head, rest) = split_head(input)
            .ok_or_else(|| TransportError::Protocol("frame has no header terminator".to_string()))?;
        let mut lines = head.lines().map(|line| line.strip_suffix('\r').unwrap_or(line));
        let command = lines
            .next()
            .filter(|command| !command.is_empty())
            .ok_or_else(|| TransportError::Protocol("frame has no command".to_string()))?
            .to_string();

        let escape = Self::escapes_headers(&command);
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::Protocol(format!("malformed header line: {line}")))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body = match rest.find('\0') {
            Some(end) => &rest[..end],
            None => rest,
        };

        Ok(Some(Self {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

fn split_head(input: &str) -> Option<(&str, &str)> {
    let lf = input.find("\n\n").map(|at| (at, 2));
    let crlf = input.find("\r\n\r\n").map(|at| (at, 4));
    let (at, len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&input[..at], &input[at + len..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Protocol(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Reject destinations that cannot be expressed on the wire.
fn check_destination(topic: &Topic) -> Result<String, LinkError> {
    if let Topic::Room(room) = topic {
        if room.is_empty() || room.contains(|c: char| c == '/' || c.is_whitespace() || c.is_control()) {
            return Err(LinkError::Rejected(format!("invalid room id: {room:?}")));
        }
    }
    Ok(topic.destination())
}

/// STOMP client transport
#[derive(Debug, Clone)]
pub struct StompTransport {
    url: String,
    token: Option<String>,
}

impl StompTransport {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    fn connect_frame(&self, host: &str) -> StompFrame {
        let frame = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0");
        match &self.token {
            Some(token) => frame.header("Authorization", format!("Bearer {token}")),
            None => frame,
        }
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid broker url: {e}")))?;
        let host = request.uri().host().unwrap_or("localhost").to_string();

        tracing::debug!(url = %self.url, "Opening broker WebSocket");
        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        ws.send(WsMessage::Text(self.connect_frame(&host).encode()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        loop {
            let text = match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            };
            let Some(frame) = StompFrame::decode(&text)? else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => {
                    tracing::debug!(version = frame.get("version").unwrap_or("?"), "STOMP session established");
                    break;
                }
                "ERROR" => {
                    let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                    return Err(TransportError::Connect(reason));
                }
                other => {
                    return Err(TransportError::Protocol(format!("expected CONNECTED, got {other}")));
                }
            }
        }

        Ok(Box::new(StompLink {
            ws,
            sub_ids: HashMap::new(),
            topics: HashMap::new(),
            next_sub: 0,
        }))
    }
}

struct StompLink {
    ws: WsStream,
    sub_ids: HashMap<Topic, String>,
    topics: HashMap<String, Topic>,
    next_sub: u64,
}

impl StompLink {
    async fn send(&mut self, frame: StompFrame) -> Result<(), TransportError> {
        self.ws
            .send(WsMessage::Text(frame.encode()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn classify(&self, frame: StompFrame) -> Option<InboundFrame> {
        match frame.command.as_str() {
            "MESSAGE" => {
                let topic = frame
                    .get("subscription")
                    .and_then(|id| self.topics.get(id).cloned())
                    .or_else(|| frame.get("destination").and_then(Topic::from_destination));
                match topic {
                    Some(topic) => Some(InboundFrame::Message {
                        topic,
                        body: frame.body,
                    }),
                    None => {
                        tracing::debug!(destination = frame.get("destination"), "MESSAGE for unknown subscription");
                        None
                    }
                }
            }
            "ERROR" => {
                let topic = frame
                    .get("subscription")
                    .and_then(|id| self.topics.get(id).cloned())
                    .or_else(|| frame.get("destination").and_then(Topic::from_destination));
                let reason = frame.get("message").map(str::to_string).unwrap_or(frame.body);
                Some(InboundFrame::Error { topic, reason })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl TransportLink for StompLink {
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), LinkError> {
        let destination = check_destination(topic)?;
        if self.sub_ids.contains_key(topic) {
            return Ok(());
        }
        self.next_sub += 1;
        let id = format!("sub-{}", self.next_sub);
        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", destination)
            .header("ack", "auto");
        self.send(frame).await?;
        self.sub_ids.insert(topic.clone(), id.clone());
        self.topics.insert(id, topic.clone());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), LinkError> {
        let Some(id) = self.sub_ids.remove(topic) else {
            return Ok(());
        };
        self.topics.remove(&id);
        self.send(StompFrame::new("UNSUBSCRIBE").header("id", id)).await?;
        Ok(())
    }

    async fn publish(&mut self, destination: &str, body: &str) -> Result<(), LinkError> {
        let frame = StompFrame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body);
        self.send(frame).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        loop {
            let text = match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Connect(e.to_string()))),
            };
            match StompFrame::decode(&text) {
                Ok(Some(frame)) => {
                    if let Some(inbound) = self.classify(frame) {
                        return Some(Ok(inbound));
                    }
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.send(StompFrame::new("DISCONNECT")).await;
        let _ = self.ws.close(None).await;
    }
}
