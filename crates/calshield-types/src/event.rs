/// Calendar event input model.
///
/// Mirrors the shape of events returned by upstream calendar read tools
/// (camelCase field names on the wire). Every text field is optional; an
/// event may carry nothing but an id.
use serde::{Deserialize, Serialize};

/// A calendar event as received from the upstream tool, before scanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    /// Upstream event identifier. The only required field.
    pub id: String,
    /// Calendar the event belongs to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    /// Event title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Free-text body. The highest-risk field: third parties control it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Location string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Organizer, if the upstream exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Organizer>,
    /// Attendee list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
    /// Attachment list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl CalendarEvent {
    /// Convenience constructor for an event with only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The organizer's email, if present.
    pub fn organizer_email(&self) -> Option<&str> {
        self.organizer.as_ref().and_then(|o| o.email.as_deref())
    }
}

/// Event organizer metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organizer {
    /// Organizer email address, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// An event attendee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    /// Attendee display name. Attacker-controllable on external invites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Attendee email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// An event attachment reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Attachment title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserializes_camel_case() {
        let json = r#"{
            "id": "evt-1",
            "calendarId": "primary",
            "summary": "Standup",
            "attendees": [{"displayName": "Alice", "email": "alice@example.com"}]
        }"#;
        let event: CalendarEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.calendar_id.as_deref(), Some("primary"));
        assert_eq!(event.attendees[0].display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_event_minimal() {
        let event: CalendarEvent = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        assert!(event.summary.is_none());
        assert!(event.attendees.is_empty());
        assert!(event.organizer_email().is_none());
    }

    #[test]
    fn test_organizer_email_helper() {
        let mut event = CalendarEvent::with_id("e");
        event.organizer = Some(Organizer {
            email: Some("boss@company.com".to_string()),
        });
        assert_eq!(event.organizer_email(), Some("boss@company.com"));
    }
}
