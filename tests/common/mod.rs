//! Shared harness: an engine over in-memory libSQL with in-process collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use outreach_engine::collaborators::{MemoryContactStore, RecordingMailSender};
use outreach_engine::config::EngineConfig;
use outreach_engine::contact::ContactSnapshot;
use outreach_engine::engine::Engine;
use outreach_engine::enrollment::Enrollment;
use outreach_engine::sequence::{Sequence, SequenceSpec};
use outreach_engine::store::{Database, LibSqlBackend};

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn Database>,
    pub contacts: Arc<MemoryContactStore>,
    pub mailer: Arc<RecordingMailSender>,
}

/// Engine settings with short retry delays and no grace period.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        send_timeout: Duration::from_millis(200),
        retry_backoff_base: Duration::from_secs(60),
        retry_backoff_max: Duration::from_secs(600),
        no_response_grace: Duration::ZERO,
        ..EngineConfig::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::on_store(store, Arc::new(MemoryContactStore::new()), config)
    }

    pub fn on_store(
        store: Arc<dyn Database>,
        contacts: Arc<MemoryContactStore>,
        config: EngineConfig,
    ) -> Self {
        let mailer = Arc::new(RecordingMailSender::new());
        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            contacts.clone(),
            mailer.clone(),
            config,
        ));
        Self {
            engine,
            store,
            contacts,
            mailer,
        }
    }

    /// Create a sequence from JSON and activate it.
    pub async fn active_sequence(&self, spec: Value, now: DateTime<Utc>) -> Sequence {
        let spec: SequenceSpec = serde_json::from_value(spec).unwrap();
        let sequence = self.engine.create_sequence(spec, now).await.unwrap();
        self.engine.resume(sequence.id, now).await.unwrap()
    }

    pub async fn enroll_one(&self, sequence_id: Uuid, contact_id: &str, now: DateTime<Utc>) -> Enrollment {
        let outcome = self
            .engine
            .enroll(sequence_id, &[contact_id.to_string()], now)
            .await
            .unwrap();
        assert!(outcome.skipped.is_empty(), "unexpected skip: {:?}", outcome.skipped);
        outcome.admitted.into_iter().next().unwrap()
    }

    pub async fn enrollment(&self, id: Uuid) -> Enrollment {
        self.store.get_enrollment(id).await.unwrap().unwrap()
    }
}

/// Monday 2026-10-19 at `h:m` UTC.
pub fn monday(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
}

/// A sequence owned by sender `s1` that sends any day, any hour.
pub fn sequence_json(steps: Value) -> Value {
    json!({
        "organizationId": "org-1",
        "senderId": "s1",
        "name": "Intro outreach",
        "steps": steps,
        "sendSchedule": always_open(),
    })
}

pub fn always_open() -> Value {
    let day = json!({"enabled": true, "startTime": "00:00", "endTime": "23:59"});
    json!({"timezone": "UTC", "days": [day, day, day, day, day, day, day]})
}

pub fn ada() -> ContactSnapshot {
    ContactSnapshot::new("c-ada")
        .with_name("Ada", "Lovelace")
        .with_email("ada@engine.io", true)
        .with_company("Analytical Engines")
}

pub fn contact(id: &str) -> ContactSnapshot {
    ContactSnapshot::new(id)
        .with_name("Grace", "Hopper")
        .with_email(format!("{id}@example.com"), true)
}
