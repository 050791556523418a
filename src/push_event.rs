use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static PUSH_EVENT_TYPES: [&str; 2] = ["PUSH_ARTIFACT", "pushImage"];

/// Registry webhook payload, as sent by Harbor.
///
/// Besides Harbor's `event_data` envelope, a bare `{resources, repository}`
/// body is accepted as well.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(try_from = "RawPushEvent")]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub occur_at: Option<DateTime<Utc>>,
    /// Who pushed, used as the event source.
    pub operator: String,
    pub event_data: EventData,
}

#[derive(Deserialize)]
struct RawPushEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    occur_at: Option<DateTime<Utc>>,
    #[serde(default)]
    operator: String,
    event_data: Option<EventData>,
    resources: Option<Vec<PushedImage>>,
    #[serde(default)]
    repository: Option<Repository>,
}

impl TryFrom<RawPushEvent> for PushEvent {
    type Error = String;

    fn try_from(raw: RawPushEvent) -> Result<Self, Self::Error> {
        let event_data = match (raw.event_data, raw.resources) {
            (Some(event_data), _) => event_data,
            (None, Some(resources)) => EventData {
                resources,
                repository: raw.repository,
            },
            (None, None) => return Err("missing field `event_data`".to_string()),
        };
        Ok(Self {
            kind: raw.kind,
            occur_at: raw.occur_at,
            operator: raw.operator,
            event_data,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventData {
    #[serde(default)]
    pub resources: Vec<PushedImage>,
    #[serde(default)]
    pub repository: Option<Repository>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushedImage {
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub tag: String,
    /// Full image reference of what was pushed (`name:tag` or `name@digest`)
    pub resource_url: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Repository {
    #[serde(default)]
    pub date_created: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub repo_full_name: String,
    #[serde(default)]
    pub repo_type: String,
}

impl PushEvent {
    /// Events without a type are treated as pushes.
    pub fn is_push(&self) -> bool {
        self.kind.is_empty() || PUSH_EVENT_TYPES.contains(&self.kind.as_str())
    }

    pub fn repository_name(&self) -> &str {
        self.event_data
            .repository
            .as_ref()
            .map(|r| r.repo_full_name.as_str())
            .unwrap_or("<unknown>")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_harbor_payload() {
        let payload = r#"{
            "type": "PUSH_ARTIFACT",
            "occur_at": 1700000000,
            "operator": "admin",
            "event_data": {
                "resources": [{
                    "digest": "sha256:5d5b1d1e",
                    "tag": "1.14.2-1",
                    "resource_url": "core.harbor.domain/library/nginx:1.14.2-1"
                }],
                "repository": {
                    "date_created": 1699990000,
                    "name": "nginx",
                    "namespace": "library",
                    "repo_full_name": "library/nginx",
                    "repo_type": "public"
                }
            }
        }"#;

        let event: PushEvent = serde_json::from_str(payload).expect("Should parse payload");

        assert!(event.is_push());
        assert_eq!(event.operator, "admin");
        assert_eq!(event.occur_at.map(|t| t.timestamp()), Some(1700000000));
        assert_eq!(event.repository_name(), "library/nginx");
        assert_eq!(event.event_data.resources.len(), 1);
        assert_eq!(
            event.event_data.resources[0].resource_url,
            "core.harbor.domain/library/nginx:1.14.2-1"
        );
    }

    #[test]
    fn test_deserialize_minimal_payload() {
        let payload = r#"{"event_data": {"resources": [{"resource_url": "nginx:1.25"}]}}"#;
        let event: PushEvent = serde_json::from_str(payload).expect("Should parse payload");
        assert!(event.is_push());
        assert!(event.occur_at.is_none());
        assert_eq!(event.repository_name(), "<unknown>");
    }

    #[test]
    fn test_non_push_event() {
        let payload = r#"{"type": "DELETE_ARTIFACT", "event_data": {}}"#;
        let event: PushEvent = serde_json::from_str(payload).expect("Should parse payload");
        assert!(!event.is_push());
    }

    #[test]
    fn test_deserialize_flat_payload() {
        let payload = r#"{
            "resources": [{"resource_url": "core.harbor.domain/library/nginx:1.14.2-1"}],
            "repository": {"repo_full_name": "library/nginx"}
        }"#;
        let event: PushEvent = serde_json::from_str(payload).expect("Should parse payload");
        assert!(event.is_push());
        assert_eq!(event.repository_name(), "library/nginx");
        assert_eq!(
            event.event_data.resources[0].resource_url,
            "core.harbor.domain/library/nginx:1.14.2-1"
        );
    }

    #[test]
    fn test_missing_event_data_is_rejected() {
        assert!(serde_json::from_str::<PushEvent>(r#"{"type": "PUSH_ARTIFACT"}"#).is_err());
    }
}
