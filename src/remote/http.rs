//! PocketBase-style HTTP adapter: REST for reads and writes, server-sent
//! events for the realtime feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};

use super::{ChangeEvent, PixelMutation, RemotePixel, RemoteStore, Scope, Subscription};
use crate::color::Color;
use crate::error::{Result, SyncError};
use crate::grid::{CanvasMeta, PixelId};

const PIXEL_COLLECTION: &str = "pixels";

// ============================================================================
// WIRE RECORDS
// ============================================================================

#[derive(Debug, Deserialize)]
struct CanvasRecord {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct PixelRecord {
    id: String,
    x: u32,
    y: u32,
    color: String,
    #[serde(default)]
    canvas_id: String,
    #[serde(default)]
    version: Option<u64>,
}

impl PixelRecord {
    fn into_remote(self) -> Result<RemotePixel> {
        Ok(RemotePixel {
            color: Color::from_hex(&self.color)?,
            id: PixelId(self.id),
            x: self.x,
            y: self.y,
            version: self.version,
        })
    }

    fn into_event(self) -> Result<ChangeEvent> {
        Ok(ChangeEvent {
            color: Color::from_hex(&self.color)?,
            canvas_id: self.canvas_id,
            pixel_id: PixelId(self.id),
            x: self.x,
            y: self.y,
            version: self.version,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PixelSnapshot {
    pixels: Vec<PixelRecord>,
}

#[derive(Debug, Serialize)]
struct PixelPatch<'a> {
    color: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    client_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest<'a> {
    client_id: &'a str,
    subscriptions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RealtimeMessage {
    #[serde(default)]
    action: String,
    record: PixelRecord,
}

// ============================================================================
// SERVER-SENT EVENTS
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Feed raw chunks, collect events.
///
/// Bytes are buffered until a full line is present, so a UTF-8 sequence split
/// across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() || !self.event.is_empty() {
                    out.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }
}

// ============================================================================
// HTTP STORE
// ============================================================================

struct Realtime {
    client_id: String,
    reader: tokio::task::AbortHandle,
}

/// REST + realtime client for a PocketBase-style backend.
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    realtime: Arc<Mutex<HashMap<Scope, Vec<Realtime>>>>,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // No client-wide timeout: it would also cut the realtime stream
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            realtime: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_subscriptions(&self, client_id: &str, subscriptions: Vec<String>) -> Result<()> {
        self.client
            .post(self.url("/api/realtime"))
            .timeout(self.timeout)
            .json(&SubscriptionRequest { client_id, subscriptions })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn forward_message(event: &SseEvent, tx: &mpsc::UnboundedSender<ChangeEvent>) -> bool {
    if event.event == "PB_CONNECT" || event.data.is_empty() {
        return true;
    }
    let message = match serde_json::from_str::<RealtimeMessage>(&event.data) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("Skipping malformed realtime message: {}", e);
            return true;
        }
    };
    if message.action == "delete" {
        return true;
    }
    match message.record.into_event() {
        Ok(change) => tx.unbounded_send(change).is_ok(),
        Err(e) => {
            log::warn!("Skipping realtime record: {}", e);
            true
        }
    }
}

impl RemoteStore for HttpStore {
    async fn fetch_canvas_meta(&self, canvas_id: &str) -> Result<CanvasMeta> {
        let record: CanvasRecord = self
            .client
            .get(self.url(&format!("/api/collections/canvases/records/{canvas_id}")))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if record.width == 0 || record.height == 0 {
            return Err(SyncError::DecodeFailure(format!(
                "canvas {canvas_id} has empty dimensions {}x{}",
                record.width, record.height
            )));
        }
        Ok(CanvasMeta::new(record.width, record.height))
    }

    async fn fetch_all_pixels(&self, canvas_id: &str) -> Result<Vec<RemotePixel>> {
        let snapshot: PixelSnapshot = self
            .client
            .get(self.url(&format!("/api/canvases/{canvas_id}/pixels")))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        snapshot.pixels.into_iter().map(PixelRecord::into_remote).collect()
    }

    async fn update_pixel(&self, mutation: &PixelMutation) -> Result<()> {
        let color = mutation.color.to_hex();
        self.client
            .patch(self.url(&format!("/api/collections/{PIXEL_COLLECTION}/records/{}", mutation.id)))
            .timeout(self.timeout)
            .json(&PixelPatch { color: &color, version: mutation.version })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn subscribe_changes(&self, scope: Scope) -> Result<Subscription> {
        let response = self
            .client
            .get(self.url("/api/realtime"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        let mut body = Box::pin(response.bytes_stream());
        let mut parser = SseParser::default();
        let mut pending = Vec::new();

        // The first event hands out the client id needed to subscribe
        let client_id = 'connect: loop {
            let Some(chunk) = tokio::time::timeout(self.timeout, body.next())
                .await
                .map_err(|_| SyncError::network("timed out waiting for PB_CONNECT"))?
            else {
                return Err(SyncError::network("realtime stream closed before PB_CONNECT"));
            };
            let mut events = parser.push(&chunk?).into_iter();
            while let Some(event) = events.next() {
                if event.event == "PB_CONNECT" {
                    let payload: ConnectPayload = serde_json::from_str(&event.data)
                        .map_err(|e| SyncError::DecodeFailure(e.to_string()))?;
                    pending.extend(events);
                    break 'connect payload.client_id;
                }
            }
        };

        self.post_subscriptions(&client_id, vec![scope.topic(PIXEL_COLLECTION)]).await?;
        log::info!("Realtime subscription {} active (client {})", scope, client_id);

        let (tx, rx) = mpsc::unbounded();
        let reader = tokio::spawn(async move {
            for event in &pending {
                if !forward_message(event, &tx) {
                    return;
                }
            }
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("Realtime stream error: {}", e);
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    if !forward_message(&event, &tx) {
                        return;
                    }
                }
            }
            log::info!("Realtime stream ended");
        });

        let abort = reader.abort_handle();
        self.realtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(scope.clone())
            .or_default()
            .push(Realtime { client_id: client_id.clone(), reader: reader.abort_handle() });

        // Releasing drops this connection only; the server forgets the client
        // once its event stream closes
        let registry = Arc::downgrade(&self.realtime);
        let release_scope = scope.clone();
        Ok(Subscription::new(scope, rx, move || {
            abort.abort();
            if let Some(registry) = registry.upgrade() {
                let mut registry = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(connections) = registry.get_mut(&release_scope) {
                    connections.retain(|c| c.client_id != client_id);
                    if connections.is_empty() {
                        registry.remove(&release_scope);
                    }
                }
            }
        }))
    }

    async fn unsubscribe(&self, scope: &Scope) -> Result<()> {
        let connections = self
            .realtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(scope)
            .unwrap_or_default();
        let mut result = Ok(());
        for connection in connections {
            connection.reader.abort();
            if let Err(e) = self.post_subscriptions(&connection.client_id, Vec::new()).await {
                log::warn!("Failed to clear subscriptions for {}: {}", connection.client_id, e);
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: PB_CONNECT\nda").is_empty());
        let events = parser.push(b"ta: {\"clientId\":\"abc\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent { event: "PB_CONNECT".into(), data: "{\"clientId\":\"abc\"}".into() }]
        );
    }

    #[test]
    fn sse_parser_keeps_multibyte_chars_split_across_chunks() {
        let mut parser = SseParser::default();
        let payload = "data: caf\u{e9} \u{1F3A8}\n\n".as_bytes();
        // Cut inside the two-byte é and again inside the four-byte emoji
        let first_cut = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let second_cut = payload.iter().position(|&b| b == 0xF0).unwrap() + 2;
        assert!(parser.push(&payload[..first_cut]).is_empty());
        assert!(parser.push(&payload[first_cut..second_cut]).is_empty());
        let events = parser.push(&payload[second_cut..]);
        assert_eq!(events, vec![SseEvent { event: String::new(), data: "caf\u{e9} \u{1F3A8}".into() }]);
    }

    #[test]
    fn sse_parser_joins_multiline_data_and_skips_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(b": keepalive\r\nevent: x\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events, vec![SseEvent { event: "x".into(), data: "a\nb".into() }]);
    }

    #[test]
    fn realtime_record_becomes_normalized_event() {
        let data = r##"{"action":"update","record":{"id":"r1","x":3,"y":4,"color":"#ff4500","canvas_id":"c9"}}"##;
        let (tx, mut rx) = mpsc::unbounded();
        assert!(forward_message(&SseEvent { event: "pixels/*".into(), data: data.into() }, &tx));
        let event = rx.try_next().unwrap().unwrap();
        assert_eq!(event.canvas_id, "c9");
        assert_eq!(event.pixel_id, PixelId::new("r1"));
        assert_eq!(event.color.to_hex(), "#FF4500");
        assert_eq!(event.version, None);
    }

    #[test]
    fn snapshot_payload_parses() {
        let body = r##"{"pixels":[{"id":"a","x":1,"y":1,"color":"#FFFFFF","version":2},{"id":"b","x":2,"y":1,"color":"#000000"}]}"##;
        let snapshot: PixelSnapshot = serde_json::from_str(body).unwrap();
        let pixels: Vec<RemotePixel> =
            snapshot.pixels.into_iter().map(PixelRecord::into_remote).collect::<Result<_>>().unwrap();
        assert_eq!(pixels[0].version, Some(2));
        assert_eq!(pixels[1].color, Color::BLACK);
    }

    #[test]
    fn patch_omits_missing_version() {
        let body = serde_json::to_string(&PixelPatch { color: "#FFFFFF", version: None }).unwrap();
        assert_eq!(body, r##"{"color":"#FFFFFF"}"##);
    }
}
