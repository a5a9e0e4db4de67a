//! Tool-response proxy adapter.
//!
//! Upstream tool results are opaque: sometimes a JSON array of events,
//! sometimes an envelope object with an `events` array, sometimes a single
//! event object, sometimes line-structured plaintext. The parser tries
//! each shape in order and yields zero events when none apply.
//!
//! [`ToolResponseSanitizer`] wraps the engine: extract events, scan each,
//! re-emit the sanitized events in the same shape, and prepend the
//! annotator's warning block when anything is above Safe.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use calshield_types::event::CalendarEvent;
use calshield_types::scan::{EventScanResult, MAX_BATCH_EVENTS};

use crate::annotator::build_annotation;
use crate::engine::ScanEngine;

/// Which payload shape the parser recognized, kept for re-emission.
enum PayloadShape {
    /// A bare JSON array of events.
    JsonArray,
    /// An object with an `events` array; the envelope is preserved so
    /// sibling keys (paging tokens etc.) survive sanitization.
    JsonEnvelope(Value),
    /// A single JSON event object.
    JsonSingle,
    /// `Key: value` line blocks separated by blank lines.
    Lines,
}

/// Extract calendar events from an opaque tool-result payload.
pub fn extract_events(payload: &str) -> Vec<CalendarEvent> {
    parse_payload(payload)
        .map(|(events, _)| events)
        .unwrap_or_default()
}

fn parse_payload(payload: &str) -> Option<(Vec<CalendarEvent>, PayloadShape)> {
    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        return match value {
            Value::Array(items) => Some((parse_event_array(&items), PayloadShape::JsonArray)),
            Value::Object(map) => {
                if let Some(Value::Array(items)) = map.get("events") {
                    let events = parse_event_array(items);
                    Some((events, PayloadShape::JsonEnvelope(Value::Object(map))))
                } else if map.get("id").and_then(Value::as_str).is_some() {
                    serde_json::from_value::<CalendarEvent>(Value::Object(map))
                        .ok()
                        .filter(|e| !e.id.is_empty())
                        .map(|e| (vec![e], PayloadShape::JsonSingle))
                } else {
                    None
                }
            }
            _ => None,
        };
    }
    parse_line_blocks(payload)
}

fn parse_event_array(items: &[Value]) -> Vec<CalendarEvent> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<CalendarEvent>(item.clone()).ok())
        .filter(|e| !e.id.is_empty())
        .collect()
}

/// Line-structured plaintext: blocks of `Key: value` lines separated by
/// blank lines. A block without an `Id` is not an event.
fn parse_line_blocks(payload: &str) -> Option<(Vec<CalendarEvent>, PayloadShape)> {
    let mut events = Vec::new();
    for block in payload.split("\n\n") {
        let mut event = CalendarEvent::default();
        for line in block.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "id" => event.id = value.to_string(),
                "calendar" | "calendarid" => event.calendar_id = Some(value.to_string()),
                "summary" | "title" => event.summary = Some(value.to_string()),
                "description" => event.description = Some(value.to_string()),
                "location" => event.location = Some(value.to_string()),
                _ => {}
            }
        }
        if !event.id.is_empty() {
            events.push(event);
        }
    }
    if events.is_empty() {
        None
    } else {
        Some((events, PayloadShape::Lines))
    }
}

/// A sanitized tool response ready to hand back to the LLM host.
#[derive(Debug, Clone)]
pub struct SanitizedToolResponse {
    /// Warning block, present when any event is above Safe.
    pub annotation: Option<String>,
    /// The response body with sanitized events, in the input's shape.
    pub body: String,
    /// Per-event scan results in extraction order.
    pub results: Vec<EventScanResult>,
}

impl SanitizedToolResponse {
    /// The full LLM-facing text: annotation (if any) above the body.
    pub fn into_text(self) -> String {
        match self.annotation {
            Some(annotation) => format!("{annotation}\n{}", self.body),
            None => self.body,
        }
    }
}

/// The thin adapter between upstream tool execution and the engine.
pub struct ToolResponseSanitizer {
    engine: Arc<ScanEngine>,
}

impl ToolResponseSanitizer {
    pub fn new(engine: Arc<ScanEngine>) -> Self {
        Self { engine }
    }

    /// Extract events from `payload`, scan them, and re-emit the response
    /// with dangerous content rewritten and a warning block attached.
    /// Payloads with no recognizable events pass through untouched.
    pub async fn sanitize_response(
        &self,
        payload: &str,
        owner_domain: Option<&str>,
    ) -> SanitizedToolResponse {
        let Some((events, shape)) = parse_payload(payload) else {
            debug!("tool payload has no recognizable events, passing through");
            return SanitizedToolResponse {
                annotation: None,
                body: payload.to_string(),
                results: Vec::new(),
            };
        };

        let scanned = self.engine.scan_batch(&events, owner_domain).await;
        let mut results = Vec::with_capacity(scanned.len());
        let mut sanitized_events = Vec::with_capacity(events.len());
        for (result, sanitized) in scanned {
            results.push(result);
            sanitized_events.push(sanitized);
        }
        // Events past the batch cap pass through unscanned rather than
        // silently disappearing from the response.
        if events.len() > MAX_BATCH_EVENTS {
            warn!(
                unscanned = events.len() - MAX_BATCH_EVENTS,
                "events beyond the batch cap were re-emitted without scanning"
            );
            sanitized_events.extend(events.into_iter().skip(MAX_BATCH_EVENTS));
        }

        let body = emit_body(&sanitized_events, shape, payload);
        let annotation = build_annotation(&results);
        SanitizedToolResponse {
            annotation,
            body,
            results,
        }
    }
}

fn emit_body(events: &[CalendarEvent], shape: PayloadShape, original: &str) -> String {
    match shape {
        PayloadShape::JsonArray => {
            serde_json::to_string_pretty(events).unwrap_or_else(|_| original.to_string())
        }
        PayloadShape::JsonEnvelope(mut envelope) => {
            match serde_json::to_value(events) {
                Ok(array) => {
                    envelope["events"] = array;
                }
                Err(e) => {
                    warn!(error = %e, "failed to re-serialize sanitized events");
                }
            }
            serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| original.to_string())
        }
        PayloadShape::JsonSingle => events
            .first()
            .and_then(|e| serde_json::to_string_pretty(e).ok())
            .unwrap_or_else(|| original.to_string()),
        PayloadShape::Lines => events
            .iter()
            .map(emit_line_block)
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn emit_line_block(event: &CalendarEvent) -> String {
    let mut lines = vec![format!("Id: {}", event.id)];
    if let Some(calendar_id) = &event.calendar_id {
        lines.push(format!("Calendar: {calendar_id}"));
    }
    if let Some(summary) = &event.summary {
        lines.push(format!("Summary: {summary}"));
    }
    if let Some(description) = &event.description {
        lines.push(format!("Description: {description}"));
    }
    if let Some(location) = &event.location {
        lines.push(format!("Location: {location}"));
    }
    lines.join("\n")
}
