//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (`2026-10-19T09:00:00.000000Z`) so that text
//! comparison in SQL orders them correctly.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::enrollment::{Enrollment, EnrollmentState};
use crate::error::DatabaseError;
use crate::rate_limit::{DispatchRecord, RateLimitConfig};
use crate::sequence::{Sequence, SequenceSpec, TriggerKind};
use crate::store::migrations;
use crate::store::traits::{Claim, Database, PendingTrigger, TriggerClaim};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_enrollments(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut enrollments = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => enrollments.push(row_to_enrollment(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(enrollments)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every TEXT time column.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s))
        .transpose()
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field} parse: {e}")))
}

fn text(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, field: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

const SEQUENCE_COLUMNS: &str = "id, status, spec, created_at, updated_at";

fn row_to_sequence(row: &libsql::Row) -> Result<Sequence, DatabaseError> {
    let id = text(row, 0, "sequence.id")?;
    let status = text(row, 1, "sequence.status")?;
    let spec = text(row, 2, "sequence.spec")?;
    let created = text(row, 3, "sequence.created_at")?;
    let updated = text(row, 4, "sequence.updated_at")?;

    let spec: SequenceSpec = serde_json::from_str(&spec)
        .map_err(|e| DatabaseError::Serialization(format!("sequence.spec: {e}")))?;

    Ok(Sequence {
        id: parse_uuid(&id, "sequence.id")?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        spec,
        created_at: parse_datetime(&created)?,
        updated_at: parse_datetime(&updated)?,
    })
}

const ENROLLMENT_COLUMNS: &str = "e.id, e.sequence_id, e.contact_id, e.sender_id, e.state, \
    e.current_step, e.next_action_at, e.enrolled_at, e.last_action_at, \
    e.consecutive_failures, e.deferral, e.review_reason, e.status_reason, e.updated_at, \
    (SELECT group_concat(t.trigger_kind) FROM trigger_outbox t \
     WHERE t.enrollment_id = e.id AND t.status = 'applied')";

const LIVE_STATES: &str = "('pending_entry', 'active', 'waiting', 'completed')";

fn row_to_enrollment(row: &libsql::Row) -> Result<Enrollment, DatabaseError> {
    let id = text(row, 0, "enrollment.id")?;
    let sequence_id = text(row, 1, "enrollment.sequence_id")?;
    let state = text(row, 4, "enrollment.state")?;
    let current_step = int(row, 5, "enrollment.current_step")?;
    let enrolled = text(row, 7, "enrollment.enrolled_at")?;
    let failures = int(row, 9, "enrollment.consecutive_failures")?;
    let updated = text(row, 13, "enrollment.updated_at")?;

    let deferral = row
        .get::<String>(10)
        .ok()
        .map(|s| s.parse())
        .transpose()
        .map_err(DatabaseError::Serialization)?;

    let applied_triggers = row
        .get::<String>(14)
        .ok()
        .map(|csv| {
            csv.split(',')
                .filter(|s| !s.is_empty())
                .map(str::parse::<TriggerKind>)
                .collect::<Result<BTreeSet<_>, _>>()
        })
        .transpose()
        .map_err(DatabaseError::Serialization)?
        .unwrap_or_default();

    Ok(Enrollment {
        id: parse_uuid(&id, "enrollment.id")?,
        sequence_id: parse_uuid(&sequence_id, "enrollment.sequence_id")?,
        contact_id: text(row, 2, "enrollment.contact_id")?,
        sender_id: text(row, 3, "enrollment.sender_id")?,
        state: state.parse().map_err(DatabaseError::Serialization)?,
        current_step: usize::try_from(current_step).unwrap_or_default(),
        next_action_at: parse_optional_datetime(row.get::<String>(6).ok())?,
        enrolled_at: parse_datetime(&enrolled)?,
        last_action_at: parse_optional_datetime(row.get::<String>(8).ok())?,
        consecutive_failures: u32::try_from(failures).unwrap_or_default(),
        deferral,
        review_reason: row.get::<String>(11).ok(),
        status_reason: row.get::<String>(12).ok(),
        applied_triggers,
        updated_at: parse_datetime(&updated)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn insert_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError> {
        let spec = serde_json::to_string(&sequence.spec)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO sequences
                    (id, organization_id, sender_id, name, status, spec, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    sequence.id.to_string(),
                    sequence.spec.organization_id.as_str(),
                    sequence.spec.sender_id.as_str(),
                    sequence.spec.name.as_str(),
                    sequence.status.as_str(),
                    spec,
                    ts(sequence.created_at),
                    ts(sequence.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_sequence: {e}")))?;

        debug!(sequence_id = %sequence.id, name = %sequence.spec.name, "Sequence inserted");
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_sequence: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_sequence(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_sequence: {e}"))),
        }
    }

    async fn update_sequence(&self, sequence: &Sequence) -> Result<bool, DatabaseError> {
        let spec = serde_json::to_string(&sequence.spec)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let count = self
            .conn()
            .execute(
                "UPDATE sequences
                 SET sender_id = ?2, name = ?3, status = ?4, spec = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    sequence.id.to_string(),
                    sequence.spec.sender_id.as_str(),
                    sequence.spec.name.as_str(),
                    sequence.status.as_str(),
                    spec,
                    ts(sequence.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_sequence: {e}")))?;
        Ok(count > 0)
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn insert_enrollment(&self, e: &Enrollment) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO enrollments
                    (id, sequence_id, contact_id, sender_id, state, current_step,
                     next_action_at, enrolled_at, last_action_at, consecutive_failures,
                     deferral, review_reason, status_reason, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    e.id.to_string(),
                    e.sequence_id.to_string(),
                    e.contact_id.as_str(),
                    e.sender_id.as_str(),
                    e.state.as_str(),
                    e.current_step as i64,
                    opt_ts(e.next_action_at),
                    ts(e.enrolled_at),
                    opt_ts(e.last_action_at),
                    i64::from(e.consecutive_failures),
                    opt_text(e.deferral.map(|d| d.as_str())),
                    opt_text(e.review_reason.as_deref()),
                    opt_text(e.status_reason.as_deref()),
                    ts(e.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_enrollment: {e}")))?;
        Ok(count > 0)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, DatabaseError> {
        let mut found = self
            .query_enrollments(
                "get_enrollment",
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments e WHERE e.id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_enrollments(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>, DatabaseError> {
        self.query_enrollments(
            "list_enrollments",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e
                 WHERE e.sequence_id = ?1 ORDER BY e.enrolled_at, e.id"
            ),
            params![sequence_id.to_string()],
        )
        .await
    }

    async fn list_flagged(&self, sequence_id: Uuid) -> Result<Vec<Enrollment>, DatabaseError> {
        self.query_enrollments(
            "list_flagged",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e
                 WHERE e.sequence_id = ?1 AND e.review_reason IS NOT NULL
                   AND e.state IN {LIVE_STATES}
                 ORDER BY e.updated_at"
            ),
            params![sequence_id.to_string()],
        )
        .await
    }

    async fn list_live_for_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        self.query_enrollments(
            "list_live_for_contact",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e
                 WHERE e.contact_id = ?1 AND e.state IN {LIVE_STATES}"
            ),
            params![contact_id],
        )
        .await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Enrollment>, DatabaseError> {
        self.query_enrollments(
            "list_due",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e
                 JOIN sequences s ON s.id = e.sequence_id
                 WHERE s.status = 'active'
                   AND e.state IN {LIVE_STATES}
                   AND e.next_action_at IS NOT NULL AND e.next_action_at <= ?1
                   AND (e.claim_token IS NULL OR e.claimed_until <= ?1)
                 ORDER BY e.sender_id, e.next_action_at, e.enrolled_at"
            ),
            params![ts(now)],
        )
        .await
    }

    async fn claim_enrollment(
        &self,
        id: Uuid,
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE enrollments SET claim_token = ?1, claimed_until = ?2
                 WHERE id = ?3 AND state = ?4 AND next_action_at IS ?5
                   AND (claim_token IS NULL OR claimed_until <= ?6)",
                params![
                    claim.token.to_string(),
                    ts(claim.until),
                    id.to_string(),
                    claim.expected_state.as_str(),
                    opt_ts(claim.expected_next_action),
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_enrollment: {e}")))?;
        Ok(count == 1)
    }

    async fn save_claimed(&self, e: &Enrollment, token: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE enrollments
                 SET state = ?1, current_step = ?2, next_action_at = ?3, last_action_at = ?4,
                     consecutive_failures = ?5, deferral = ?6, review_reason = ?7,
                     status_reason = ?8, updated_at = ?9,
                     claim_token = NULL, claimed_until = NULL
                 WHERE id = ?10 AND claim_token = ?11",
                params![
                    e.state.as_str(),
                    e.current_step as i64,
                    opt_ts(e.next_action_at),
                    opt_ts(e.last_action_at),
                    i64::from(e.consecutive_failures),
                    opt_text(e.deferral.map(|d| d.as_str())),
                    opt_text(e.review_reason.as_deref()),
                    opt_text(e.status_reason.as_deref()),
                    ts(e.updated_at),
                    e.id.to_string(),
                    token.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_claimed: {e}")))?;
        Ok(count == 1)
    }

    async fn release_claim(&self, id: Uuid, token: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE enrollments SET claim_token = NULL, claimed_until = NULL
                 WHERE id = ?1 AND claim_token = ?2",
                params![id.to_string(), token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(())
    }

    async fn save_if_state(
        &self,
        e: &Enrollment,
        expected_state: EnrollmentState,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE enrollments
                 SET state = ?1, current_step = ?2, next_action_at = ?3, last_action_at = ?4,
                     consecutive_failures = ?5, deferral = ?6, review_reason = ?7,
                     status_reason = ?8, updated_at = ?9,
                     claim_token = NULL, claimed_until = NULL
                 WHERE id = ?10 AND state = ?11",
                params![
                    e.state.as_str(),
                    e.current_step as i64,
                    opt_ts(e.next_action_at),
                    opt_ts(e.last_action_at),
                    i64::from(e.consecutive_failures),
                    opt_text(e.deferral.map(|d| d.as_str())),
                    opt_text(e.review_reason.as_deref()),
                    opt_text(e.status_reason.as_deref()),
                    ts(e.updated_at),
                    e.id.to_string(),
                    expected_state.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_if_state: {e}")))?;
        Ok(count == 1)
    }

    async fn reschedule_rate_deferred(
        &self,
        sender_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE enrollments SET next_action_at = ?1, updated_at = ?2
                     WHERE sender_id = ?3 AND deferral = 'rate_limited'
                       AND state IN {LIVE_STATES} AND next_action_at > ?1"
                ),
                params![ts(until), ts(now), sender_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_rate_deferred: {e}")))?;
        Ok(count as usize)
    }

    // ── Automation ──────────────────────────────────────────────────

    async fn enqueue_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO trigger_outbox (enrollment_id, trigger_kind, created_at)
                 VALUES (?1, ?2, ?3)",
                params![enrollment_id.to_string(), kind.as_str(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_trigger: {e}")))?;
        Ok(())
    }

    async fn claim_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TriggerClaim, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE trigger_outbox SET claim_token = ?1, claimed_until = ?2
                 WHERE enrollment_id = ?3 AND trigger_kind = ?4 AND status = 'pending'
                   AND (claim_token IS NULL OR claimed_until <= ?5)",
                params![
                    token.to_string(),
                    ts(until),
                    enrollment_id.to_string(),
                    kind.as_str(),
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_trigger: {e}")))?;
        if count == 1 {
            return Ok(TriggerClaim::Claimed);
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM trigger_outbox WHERE enrollment_id = ?1 AND trigger_kind = ?2",
                params![enrollment_id.to_string(), kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_trigger: {e}")))?;
        let status = match rows.next().await {
            Ok(Some(row)) => Some(text(&row, 0, "trigger_outbox.status")?),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("claim_trigger: {e}"))),
        };
        if status.as_deref() == Some("applied") {
            Ok(TriggerClaim::Applied)
        } else {
            Ok(TriggerClaim::Busy)
        }
    }

    async fn complete_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE trigger_outbox
                 SET status = 'applied', applied_at = ?1, last_error = NULL,
                     claim_token = NULL, claimed_until = NULL
                 WHERE enrollment_id = ?2 AND trigger_kind = ?3 AND claim_token = ?4",
                params![
                    ts(now),
                    enrollment_id.to_string(),
                    kind.as_str(),
                    token.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_trigger: {e}")))?;
        Ok(count == 1)
    }

    async fn fail_trigger(
        &self,
        enrollment_id: Uuid,
        kind: TriggerKind,
        token: Uuid,
        error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE trigger_outbox
                 SET retry_count = retry_count + 1, last_error = ?1,
                     claim_token = NULL, claimed_until = NULL
                 WHERE enrollment_id = ?2 AND trigger_kind = ?3 AND claim_token = ?4",
                params![error, enrollment_id.to_string(), kind.as_str(), token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_trigger: {e}")))?;
        Ok(())
    }

    async fn list_pending_triggers(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<PendingTrigger>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT enrollment_id, trigger_kind, retry_count, last_error FROM trigger_outbox
                 WHERE status = 'pending' AND retry_count < ?1
                   AND (claim_token IS NULL OR claimed_until <= ?2)
                 ORDER BY created_at, enrollment_id",
                params![i64::from(max_attempts), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_triggers: {e}")))?;

        let mut pending = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id = text(&row, 0, "trigger_outbox.enrollment_id")?;
                    let kind = text(&row, 1, "trigger_outbox.trigger_kind")?;
                    pending.push(PendingTrigger {
                        enrollment_id: parse_uuid(&id, "trigger_outbox.enrollment_id")?,
                        kind: kind.parse().map_err(DatabaseError::Serialization)?,
                        retry_count: u32::try_from(int(&row, 2, "trigger_outbox.retry_count")?)
                            .unwrap_or_default(),
                        last_error: row.get::<String>(3).ok(),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_pending_triggers: {e}"))),
            }
        }
        Ok(pending)
    }

    // ── Sender quotas ───────────────────────────────────────────────

    async fn get_rate_limits(
        &self,
        sender_id: &str,
    ) -> Result<Option<RateLimitConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT config FROM rate_limits WHERE sender_id = ?1",
                params![sender_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rate_limits: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw = text(&row, 0, "rate_limits.config")?;
                let config = serde_json::from_str(&raw)
                    .map_err(|e| DatabaseError::Serialization(format!("rate_limits.config: {e}")))?;
                Ok(Some(config))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_rate_limits: {e}"))),
        }
    }

    async fn set_rate_limits(
        &self,
        sender_id: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(config)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO rate_limits (sender_id, config, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (sender_id) DO UPDATE SET config = ?2, updated_at = ?3",
                params![sender_id, raw, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rate_limits: {e}")))?;
        Ok(())
    }

    async fn insert_dispatch(&self, record: &DispatchRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO dispatches (id, sender_id, enrollment_id, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.to_string(),
                    record.sender_id.as_str(),
                    record.enrollment_id.to_string(),
                    ts(record.sent_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_dispatch: {e}")))?;
        Ok(())
    }

    async fn delete_dispatch(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM dispatches WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_dispatch: {e}")))?;
        Ok(count > 0)
    }

    async fn list_dispatch_times(
        &self,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT sent_at FROM dispatches
                 WHERE sender_id = ?1 AND sent_at > ?2 ORDER BY sent_at",
                params![sender_id, ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatch_times: {e}")))?;

        let mut times = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let raw = text(&row, 0, "dispatches.sent_at")?;
                    times.push(parse_datetime(&raw)?);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_dispatch_times: {e}"))),
            }
        }
        Ok(times)
    }

    async fn prune_dispatches(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM dispatches WHERE sent_at <= ?1",
                params![ts(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_dispatches: {e}")))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::enrollment::{Deferral, EventKind};
    use crate::sequence::{SequenceStatus, Step};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, 0, 0).unwrap()
    }

    fn make_sequence(status: SequenceStatus) -> Sequence {
        let spec: SequenceSpec = serde_json::from_value(serde_json::json!({
            "organizationId": "org-1",
            "senderId": "sender-1",
            "name": "Intro",
            "steps": [
                {"type": "email", "subject": "Hi {{firstName}}", "body": "Hello"},
                {"type": "wait", "days": 2},
            ],
        }))
        .unwrap();
        let mut seq = Sequence::create(spec, at(8)).unwrap();
        seq.status = status;
        seq
    }

    async fn seeded(db: &LibSqlBackend, contact: &str) -> (Sequence, Enrollment) {
        let seq = make_sequence(SequenceStatus::Active);
        db.insert_sequence(&seq).await.unwrap();
        let enrollment = Enrollment::new(&seq, contact, at(9));
        assert!(db.insert_enrollment(&enrollment).await.unwrap());
        (seq, enrollment)
    }

    fn claim_for(e: &Enrollment, until: DateTime<Utc>) -> Claim {
        Claim {
            token: Uuid::new_v4(),
            until,
            expected_state: e.state,
            expected_next_action: e.next_action_at,
        }
    }

    // ── Sequence tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn sequence_round_trip() {
        let db = test_db().await;
        let seq = make_sequence(SequenceStatus::Draft);
        db.insert_sequence(&seq).await.unwrap();

        let fetched = db.get_sequence(seq.id).await.unwrap().unwrap();
        assert_eq!(fetched, seq);
        assert!(db.get_sequence(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sequence_update_changes_status_and_steps() {
        let db = test_db().await;
        let mut seq = make_sequence(SequenceStatus::Draft);
        db.insert_sequence(&seq).await.unwrap();

        seq.status = SequenceStatus::Paused;
        seq.spec.steps.push(Step::email("Last", "Bye"));
        seq.updated_at = at(12);
        assert!(db.update_sequence(&seq).await.unwrap());

        let fetched = db.get_sequence(seq.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SequenceStatus::Paused);
        assert_eq!(fetched.step_count(), 3);
    }

    // ── Enrollment tests ────────────────────────────────────────────

    #[tokio::test]
    async fn enrollment_round_trip() {
        let db = test_db().await;
        let (_, enrollment) = seeded(&db, "c1").await;
        let fetched = db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(fetched, enrollment);
    }

    #[tokio::test]
    async fn second_live_enrollment_is_rejected() {
        let db = test_db().await;
        let (seq, _) = seeded(&db, "c1").await;
        let dup = Enrollment::new(&seq, "c1", at(10));
        assert!(!db.insert_enrollment(&dup).await.unwrap());
        assert_eq!(db.list_enrollments(seq.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn due_query_skips_paused_sequences_and_future_actions() {
        let db = test_db().await;
        let (_, due) = seeded(&db, "c1").await;

        let paused = make_sequence(SequenceStatus::Paused);
        db.insert_sequence(&paused).await.unwrap();
        db.insert_enrollment(&Enrollment::new(&paused, "c2", at(9)))
            .await
            .unwrap();

        let found = db.list_due(at(9)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        assert!(db.list_due(at(8)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_it_expires() {
        let db = test_db().await;
        let (_, e) = seeded(&db, "c1").await;

        let first = claim_for(&e, at(10));
        assert!(db.claim_enrollment(e.id, &first, at(9)).await.unwrap());

        let second = claim_for(&e, at(10));
        assert!(!db.claim_enrollment(e.id, &second, at(9)).await.unwrap());
        assert!(db.list_due(at(9)).await.unwrap().is_empty());

        // Stale claim can be taken over.
        assert!(db.claim_enrollment(e.id, &second, at(10)).await.unwrap());
        assert!(!db.save_claimed(&e, first.token).await.unwrap());
    }

    #[tokio::test]
    async fn claim_fails_when_next_action_moved() {
        let db = test_db().await;
        let (_, mut e) = seeded(&db, "c1").await;
        let stale = claim_for(&e, at(10));

        let claim = claim_for(&e, at(10));
        assert!(db.claim_enrollment(e.id, &claim, at(9)).await.unwrap());
        e.admit(at(9)).unwrap();
        e.next_action_at = Some(at(11));
        assert!(db.save_claimed(&e, claim.token).await.unwrap());

        assert!(!db.claim_enrollment(e.id, &stale, at(9)).await.unwrap());
    }

    #[tokio::test]
    async fn external_save_invalidates_claim() {
        let db = test_db().await;
        let (_, mut e) = seeded(&db, "c1").await;
        let claim = claim_for(&e, at(10));
        assert!(db.claim_enrollment(e.id, &claim, at(9)).await.unwrap());

        let mut removed = e.clone();
        removed.remove("unenrolled", at(9)).unwrap();
        assert!(db.save_if_state(&removed, EnrollmentState::PendingEntry).await.unwrap());

        e.admit(at(9)).unwrap();
        assert!(!db.save_claimed(&e, claim.token).await.unwrap());
        let stored = db.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(stored.state, EnrollmentState::Removed);
    }

    #[tokio::test]
    async fn flagged_and_contact_listings() {
        let db = test_db().await;
        let (seq, mut e) = seeded(&db, "c1").await;
        e.admit(at(9)).unwrap();
        e.flag_for_review("no value for firstName", at(12), at(9));
        assert!(db.save_if_state(&e, EnrollmentState::PendingEntry).await.unwrap());

        let flagged = db.list_flagged(seq.id).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].deferral, Some(Deferral::RenderBlocked));
        assert_eq!(db.list_live_for_contact("c1").await.unwrap().len(), 1);
        assert!(db.list_live_for_contact("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_only_moves_rate_deferred() {
        let db = test_db().await;
        let (seq, mut limited) = seeded(&db, "c1").await;
        limited.admit(at(9)).unwrap();
        limited.defer(at(15), Deferral::RateLimited, at(9));
        db.save_if_state(&limited, EnrollmentState::PendingEntry).await.unwrap();

        let mut other = Enrollment::new(&seq, "c2", at(9));
        db.insert_enrollment(&other).await.unwrap();
        other.admit(at(9)).unwrap();
        other.defer(at(15), Deferral::RetryBackoff, at(9));
        db.save_if_state(&other, EnrollmentState::PendingEntry).await.unwrap();

        let moved = db
            .reschedule_rate_deferred("sender-1", at(10), at(9))
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let reloaded = db.get_enrollment(limited.id).await.unwrap().unwrap();
        assert_eq!(reloaded.next_action_at, Some(at(10)));
        let untouched = db.get_enrollment(other.id).await.unwrap().unwrap();
        assert_eq!(untouched.next_action_at, Some(at(15)));
    }

    // ── Trigger tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn outcome_transition_queues_its_trigger() {
        let db = test_db().await;
        let (_, mut e) = seeded(&db, "c1").await;
        e.admit(at(9)).unwrap();
        db.save_if_state(&e, EnrollmentState::PendingEntry).await.unwrap();
        assert!(db.list_pending_triggers(at(9), 5).await.unwrap().is_empty());

        e.apply_event(EventKind::Bounced, at(10)).unwrap();
        assert!(db.save_if_state(&e, EnrollmentState::Active).await.unwrap());

        let pending = db.list_pending_triggers(at(10), 5).await.unwrap();
        assert_eq!(
            pending,
            vec![PendingTrigger {
                enrollment_id: e.id,
                kind: TriggerKind::OnBounced,
                retry_count: 0,
                last_error: None,
            }]
        );
    }

    #[tokio::test]
    async fn trigger_claim_fail_and_complete() {
        let db = test_db().await;
        let (_, e) = seeded(&db, "c1").await;
        db.enqueue_trigger(e.id, TriggerKind::OnReplied, at(9)).await.unwrap();
        db.enqueue_trigger(e.id, TriggerKind::OnReplied, at(9)).await.unwrap();

        let first = Uuid::new_v4();
        assert_eq!(
            db.claim_trigger(e.id, TriggerKind::OnReplied, first, at(10), at(9)).await.unwrap(),
            TriggerClaim::Claimed
        );
        assert_eq!(
            db.claim_trigger(e.id, TriggerKind::OnReplied, Uuid::new_v4(), at(10), at(9))
                .await
                .unwrap(),
            TriggerClaim::Busy
        );
        assert!(db.list_pending_triggers(at(9), 5).await.unwrap().is_empty());

        db.fail_trigger(e.id, TriggerKind::OnReplied, first, "503").await.unwrap();
        let pending = db.list_pending_triggers(at(9), 5).await.unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("503"));
        assert!(db.list_pending_triggers(at(9), 1).await.unwrap().is_empty());

        let second = Uuid::new_v4();
        db.claim_trigger(e.id, TriggerKind::OnReplied, second, at(10), at(9)).await.unwrap();
        assert!(!db.complete_trigger(e.id, TriggerKind::OnReplied, first, at(9)).await.unwrap());
        assert!(db.complete_trigger(e.id, TriggerKind::OnReplied, second, at(9)).await.unwrap());
        assert_eq!(
            db.claim_trigger(e.id, TriggerKind::OnReplied, Uuid::new_v4(), at(10), at(9))
                .await
                .unwrap(),
            TriggerClaim::Applied
        );

        let fetched = db.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(fetched.applied_triggers, BTreeSet::from([TriggerKind::OnReplied]));
    }

    #[tokio::test]
    async fn expired_trigger_claim_can_be_retaken() {
        let db = test_db().await;
        let (_, e) = seeded(&db, "c1").await;
        db.enqueue_trigger(e.id, TriggerKind::OnBounced, at(9)).await.unwrap();
        db.claim_trigger(e.id, TriggerKind::OnBounced, Uuid::new_v4(), at(10), at(9))
            .await
            .unwrap();

        assert_eq!(db.list_pending_triggers(at(11), 5).await.unwrap().len(), 1);
        assert_eq!(
            db.claim_trigger(e.id, TriggerKind::OnBounced, Uuid::new_v4(), at(12), at(11))
                .await
                .unwrap(),
            TriggerClaim::Claimed
        );
    }

    // ── Quota tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limits_upsert() {
        let db = test_db().await;
        assert!(db.get_rate_limits("s").await.unwrap().is_none());

        let mut config = RateLimitConfig::default();
        db.set_rate_limits("s", &config, at(9)).await.unwrap();
        config.hourly_send_limit = 12;
        db.set_rate_limits("s", &config, at(10)).await.unwrap();

        assert_eq!(db.get_rate_limits("s").await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn dispatch_records_window_and_prune() {
        let db = test_db().await;
        let enrollment_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for h in [1, 5, 9] {
            let record = DispatchRecord::new("s", enrollment_id, at(h));
            ids.push(record.id);
            db.insert_dispatch(&record).await.unwrap();
        }

        assert_eq!(db.list_dispatch_times("s", at(1)).await.unwrap(), vec![at(5), at(9)]);
        assert!(db.list_dispatch_times("other", at(0)).await.unwrap().is_empty());

        assert!(db.delete_dispatch(ids[2]).await.unwrap());
        assert_eq!(db.prune_dispatches(at(1) + Duration::minutes(1)).await.unwrap(), 1);
        assert_eq!(db.list_dispatch_times("s", at(0)).await.unwrap(), vec![at(5)]);
    }
}
