//! Core data model: exhibit definitions, runtime state and lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Declarative definition of a gateway-managed backend application.
///
/// Immutable after creation: the id is assigned by the gateway and the
/// definition is only ever removed by an explicit delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exhibit {
    /// Unique id, assigned at creation
    pub id: String,
    /// Human-readable name, also used for the instance name
    pub name: String,
    /// Container image to run
    pub image: String,
    /// Command arguments passed to the container
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment template; values may contain `{{exhibit_id}}`,
    /// `{{exhibit_name}}` and `{{port}}` placeholders
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Port the backend listens on inside the container
    pub port: u16,
    /// Readiness probe run after start
    #[serde(default)]
    pub livecheck: LivecheckSpec,
    /// Idle seconds after the last proxied request before the backend is stopped
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    300
}

/// Exhibit definition as submitted to `POST /api/exhibits` (no id yet)
#[derive(Debug, Clone, Deserialize)]
pub struct ExhibitDefinition {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub port: u16,
    #[serde(default)]
    pub livecheck: LivecheckSpec,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl ExhibitDefinition {
    /// Materialize the definition into an exhibit with a fresh id
    pub fn into_exhibit(self) -> Exhibit {
        Exhibit {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            image: self.image,
            args: self.args,
            environment: self.environment,
            port: self.port,
            livecheck: self.livecheck,
            idle_ttl_secs: self.idle_ttl_secs,
        }
    }
}

/// Probe flavor for the readiness check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LivecheckProbe {
    /// HTTP GET against the backend; accepts the configured status class
    Http {
        #[serde(default = "default_livecheck_path")]
        path: String,
        #[serde(default = "default_expect_status")]
        expect_status: u16,
    },
    /// Command run inside the instance; accepts the configured exit status
    Exec {
        command: Vec<String>,
        #[serde(default)]
        expect_exit: i64,
    },
}

fn default_livecheck_path() -> String {
    "/".to_string()
}

fn default_expect_status() -> u16 {
    200
}

/// Readiness probe spec: what to probe and how long to keep trying
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivecheckSpec {
    #[serde(flatten)]
    pub probe: LivecheckProbe,
    /// Delay between attempts
    #[serde(default = "default_livecheck_interval_ms")]
    pub interval_ms: u64,
    /// Overall budget; the check never blocks past this
    #[serde(default = "default_livecheck_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempt budget
    #[serde(default = "default_livecheck_attempts")]
    pub max_attempts: u32,
}

fn default_livecheck_interval_ms() -> u64 {
    500
}

fn default_livecheck_timeout_secs() -> u64 {
    30
}

fn default_livecheck_attempts() -> u32 {
    60
}

impl Default for LivecheckSpec {
    fn default() -> Self {
        Self {
            probe: LivecheckProbe::Http {
                path: default_livecheck_path(),
                expect_status: default_expect_status(),
            },
            interval_ms: default_livecheck_interval_ms(),
            timeout_secs: default_livecheck_timeout_secs(),
            max_attempts: default_livecheck_attempts(),
        }
    }
}

/// Execution state of an exhibit's backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Live execution state of an exhibit's backend instance.
///
/// Exactly one record exists per exhibit id. All mutations happen while
/// holding the write lock on `(id, "runtime_info")`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhibitRuntimeInfo {
    pub status: RuntimeStatus,
    /// Reachable backend address (`host:port`) while Running
    pub address: Option<String>,
    /// Backend instance identifier in the container runtime
    pub instance_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ExhibitRuntimeInfo {
    fn default() -> Self {
        Self {
            status: RuntimeStatus::Stopped,
            address: None,
            instance_id: None,
            started_at: None,
        }
    }
}

/// Exhibit definition plus its current runtime status, as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct ExhibitDto {
    #[serde(flatten)]
    pub exhibit: Exhibit,
    pub status: RuntimeStatus,
}

/// Kind of an asynchronous lifecycle message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "exhibit.start")]
    Start,
    #[serde(rename = "exhibit.stop")]
    Stop,
}

/// Start/stop lifecycle message, compatible with the generic cloud-event
/// envelope. Transported at-least-once; handlers must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "specversion", default = "default_spec_version")]
    pub spec_version: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub time: DateTime<Utc>,
    #[serde(
        rename = "correlationid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    pub data: LifecycleEventData,
}

/// Event payload carrying the target exhibit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEventData {
    pub exhibit_id: String,
}

fn default_spec_version() -> String {
    "1.0".to_string()
}

const EVENT_SOURCE: &str = "galleria";

impl LifecycleEvent {
    fn new(kind: EventKind, exhibit_id: &str) -> Self {
        Self {
            spec_version: default_spec_version(),
            id: Uuid::new_v4().to_string(),
            kind,
            source: EVENT_SOURCE.to_string(),
            time: Utc::now(),
            correlation_id: Some(Uuid::new_v4().to_string()),
            data: LifecycleEventData {
                exhibit_id: exhibit_id.to_string(),
            },
        }
    }

    pub fn start(exhibit_id: &str) -> Self {
        Self::new(EventKind::Start, exhibit_id)
    }

    pub fn stop(exhibit_id: &str) -> Self {
        Self::new(EventKind::Stop, exhibit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_assigns_unique_ids() {
        let def = ExhibitDefinition {
            name: "demo".to_string(),
            image: "nginx:alpine".to_string(),
            args: Vec::new(),
            environment: HashMap::new(),
            port: 80,
            livecheck: LivecheckSpec::default(),
            idle_ttl_secs: 60,
        };

        let a = def.clone().into_exhibit();
        let b = def.into_exhibit();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_exhibit_json_round_trip() {
        let json = r#"{
            "name": "demo",
            "image": "nginx:alpine",
            "port": 8080,
            "environment": {"GREETING": "hello {{exhibit_name}}"},
            "livecheck": {"kind": "http", "path": "/healthz"},
            "idle_ttl_secs": 120
        }"#;

        let def: ExhibitDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.port, 8080);
        assert_eq!(def.idle_ttl_secs, 120);
        match &def.livecheck.probe {
            LivecheckProbe::Http {
                path,
                expect_status,
            } => {
                assert_eq!(path, "/healthz");
                assert_eq!(*expect_status, 200);
            }
            other => panic!("unexpected probe: {:?}", other),
        }
    }

    #[test]
    fn test_livecheck_defaults_when_omitted() {
        let json = r#"{"name": "d", "image": "i", "port": 80}"#;
        let def: ExhibitDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.livecheck.max_attempts, 60);
        assert!(matches!(
            def.livecheck.probe,
            LivecheckProbe::Http { .. }
        ));
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = LifecycleEvent::start("ex-1");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["type"], "exhibit.start");
        assert_eq!(json["source"], "galleria");
        assert_eq!(json["data"]["exhibit_id"], "ex-1");

        let parsed: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind, EventKind::Start);
        assert_eq!(parsed.data.exhibit_id, "ex-1");
    }

    #[test]
    fn test_runtime_info_defaults_to_stopped() {
        let info = ExhibitRuntimeInfo::default();
        assert_eq!(info.status, RuntimeStatus::Stopped);
        assert!(info.address.is_none());
        assert!(info.instance_id.is_none());
    }
}
