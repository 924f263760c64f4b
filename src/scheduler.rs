//! The dispatcher: one pass over every due enrollment per tick.
//!
//! A tick lists due enrollments of active sequences, groups them by sender and
//! runs senders concurrently (bounded by `max_parallel_senders`). Within a
//! sender, enrollments are handled one at a time in next-action order so the
//! rate limiter sees them in a stable order.
//!
//! Each enrollment is claimed with a conditional update before anything
//! happens and saved with the same claim token afterwards. Event ingestion and
//! unenroll clear the claim, so a save that raced with them is discarded.
//! An outcome state and its queued trigger are saved together; the trigger's
//! side effects run after the save, and each tick first retries any trigger
//! left pending by an earlier failure or crash.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::automation::{AutomationEngine, FailedTrigger};
use crate::collaborators::{ContactStore, MailSender, OutboundEmail};
use crate::config::EngineConfig;
use crate::contact::ContactSnapshot;
use crate::criteria;
use crate::enrollment::{Enrollment, EnrollmentState, NextMove};
use crate::error::{ContactStoreError, DispatchError, EnrollmentError, Result};
use crate::rate_limit::{RateLimiter, ReserveOutcome};
use crate::sequence::{Sequence, TriggerKind, render_email};
use crate::store::{Claim, Database};

/// Capacity of the notice broadcast channel.
const NOTICE_CAPACITY: usize = 256;

/// Things the owning user should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotice {
    /// A contact did not pass entering criteria.
    Skipped {
        sequence_id: Uuid,
        contact_id: String,
        reason: String,
    },
    /// A send is held until the contact data is fixed.
    RenderBlocked {
        sequence_id: Uuid,
        enrollment_id: Uuid,
        contact_id: String,
        reason: String,
    },
    /// A send failed and will be retried.
    DispatchFailed {
        sequence_id: Uuid,
        enrollment_id: Uuid,
        contact_id: String,
        attempt: u32,
        reason: String,
        retry_at: DateTime<Utc>,
    },
    Bounced {
        sequence_id: Uuid,
        enrollment_id: Uuid,
        contact_id: String,
        reason: String,
    },
    NoResponse {
        sequence_id: Uuid,
        enrollment_id: Uuid,
        contact_id: String,
    },
    /// An automation rule could not update the contact; it is retried.
    AutomationFailed {
        sequence_id: Uuid,
        enrollment_id: Uuid,
        contact_id: String,
        trigger: TriggerKind,
        reason: String,
    },
}

impl EngineNotice {
    pub fn sequence_id(&self) -> Uuid {
        match self {
            Self::Skipped { sequence_id, .. }
            | Self::RenderBlocked { sequence_id, .. }
            | Self::DispatchFailed { sequence_id, .. }
            | Self::Bounced { sequence_id, .. }
            | Self::NoResponse { sequence_id, .. }
            | Self::AutomationFailed { sequence_id, .. } => *sequence_id,
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub admitted: usize,
    pub skipped: usize,
    pub sent: usize,
    pub deferred: usize,
    pub waiting: usize,
    pub completed: usize,
    pub no_response: usize,
    pub bounced: usize,
    /// Enrollments whose processing errored; they are retried next tick.
    pub failed: usize,
    /// Pending triggers completed by the retry sweep.
    pub triggers_retried: usize,
    /// Trigger attempts whose side effects failed.
    pub triggers_failed: usize,
}

impl TickReport {
    fn merge(&mut self, other: &TickReport) {
        self.admitted += other.admitted;
        self.skipped += other.skipped;
        self.sent += other.sent;
        self.deferred += other.deferred;
        self.waiting += other.waiting;
        self.completed += other.completed;
        self.no_response += other.no_response;
        self.bounced += other.bounced;
        self.failed += other.failed;
        self.triggers_retried += other.triggers_retried;
        self.triggers_failed += other.triggers_failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

/// Retry delay after the `attempt`-th consecutive failure, before jitter.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(max)
}

fn with_jitter(delay: Duration) -> Duration {
    let cap = delay.as_millis() as u64 / 10;
    if cap == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Per-enrollment state carried through one pass.
struct Pass {
    report: TickReport,
    triggers: Vec<TriggerKind>,
    contact: Option<ContactSnapshot>,
    sent: bool,
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    contacts: Arc<dyn ContactStore>,
    mailer: Arc<dyn MailSender>,
    limiter: Arc<RateLimiter>,
    automation: Arc<AutomationEngine>,
    config: EngineConfig,
    notices: broadcast::Sender<EngineNotice>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Database>,
        contacts: Arc<dyn ContactStore>,
        mailer: Arc<dyn MailSender>,
        limiter: Arc<RateLimiter>,
        config: EngineConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let automation = Arc::new(AutomationEngine::new(
            Arc::clone(&store),
            Arc::clone(&contacts),
            chrono_duration(config.claim_ttl),
        ));
        Self {
            store,
            contacts,
            mailer,
            limiter,
            automation,
            config,
            notices,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notify(&self, notice: EngineNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    pub(crate) fn automation(&self) -> &AutomationEngine {
        &self.automation
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn notify_automation_failed(&self, failed: FailedTrigger) {
        self.notify(EngineNotice::AutomationFailed {
            sequence_id: failed.sequence_id,
            enrollment_id: failed.enrollment_id,
            contact_id: failed.contact_id,
            trigger: failed.kind,
            reason: failed.reason,
        });
    }

    /// Run one pass over everything due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let sweep = self
            .automation
            .retry_pending(now, self.config.max_trigger_attempts)
            .await?;
        let mut retried = TickReport {
            triggers_retried: sweep.applied,
            triggers_failed: sweep.failed.len(),
            ..TickReport::default()
        };
        for failed in sweep.failed {
            self.notify_automation_failed(failed);
        }

        let due = self.store.list_due(now).await?;
        if due.is_empty() {
            debug!(triggers_retried = retried.triggers_retried, "Tick: nothing due");
            return Ok(retried);
        }

        let mut by_sender: BTreeMap<String, Vec<Enrollment>> = BTreeMap::new();
        for enrollment in due {
            by_sender
                .entry(enrollment.sender_id.clone())
                .or_default()
                .push(enrollment);
        }

        let totals = Mutex::new(TickReport::default());
        stream::iter(by_sender)
            .for_each_concurrent(self.config.max_parallel_senders.max(1), |(sender, batch)| {
                let totals = &totals;
                async move {
                    let report = self.run_sender(&sender, batch, now).await;
                    totals.lock().await.merge(&report);
                }
            })
            .await;

        if let Err(e) = self.limiter.prune_records(now).await {
            warn!(error = %e, "Failed to prune old dispatch records");
        }

        retried.merge(&totals.into_inner());
        let report = retried;
        info!(
            admitted = report.admitted,
            skipped = report.skipped,
            sent = report.sent,
            deferred = report.deferred,
            waiting = report.waiting,
            completed = report.completed,
            no_response = report.no_response,
            bounced = report.bounced,
            failed = report.failed,
            triggers_retried = report.triggers_retried,
            triggers_failed = report.triggers_failed,
            "Tick complete"
        );
        Ok(report)
    }

    async fn run_sender(
        &self,
        sender: &str,
        batch: Vec<Enrollment>,
        now: DateTime<Utc>,
    ) -> TickReport {
        let mut report = TickReport::default();
        let mut sequences: HashMap<Uuid, Arc<Sequence>> = HashMap::new();

        debug!(sender = %sender, due = batch.len(), "Processing sender");
        for enrollment in batch {
            let id = enrollment.id;
            match self.process(&mut sequences, enrollment, now).await {
                Ok(partial) => report.merge(&partial),
                Err(e) => {
                    report.failed += 1;
                    error!(enrollment_id = %id, sender = %sender, error = %e, "Enrollment processing failed");
                }
            }
        }
        report
    }

    async fn sequence(
        &self,
        cache: &mut HashMap<Uuid, Arc<Sequence>>,
        id: Uuid,
    ) -> Result<Arc<Sequence>> {
        if let Some(seq) = cache.get(&id) {
            return Ok(Arc::clone(seq));
        }
        let seq = self
            .store
            .get_sequence(id)
            .await?
            .ok_or(EnrollmentError::SequenceNotFound { id })?;
        let seq = Arc::new(seq);
        cache.insert(id, Arc::clone(&seq));
        Ok(seq)
    }

    /// Claim, drive and save one enrollment.
    async fn process(
        &self,
        cache: &mut HashMap<Uuid, Arc<Sequence>>,
        mut enrollment: Enrollment,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let claim = Claim {
            token: Uuid::new_v4(),
            until: now + chrono_duration(self.config.claim_ttl),
            expected_state: enrollment.state,
            expected_next_action: enrollment.next_action_at,
        };
        if !self.store.claim_enrollment(enrollment.id, &claim, now).await? {
            debug!(enrollment_id = %enrollment.id, "Claim not taken; already handled");
            return Ok(TickReport::default());
        }

        let (sequence, pass) = match self.run_claimed(cache, &mut enrollment, now).await {
            Ok(Some(done)) => done,
            Ok(None) => {
                self.store.release_claim(enrollment.id, claim.token).await?;
                return Ok(TickReport::default());
            }
            Err(e) => {
                if let Err(release) = self.store.release_claim(enrollment.id, claim.token).await {
                    error!(enrollment_id = %enrollment.id, error = %release, "Failed to release claim");
                }
                return Err(e);
            }
        };

        if !self.store.save_claimed(&enrollment, claim.token).await? {
            warn!(
                enrollment_id = %enrollment.id,
                "Enrollment changed while processing; result discarded"
            );
            return Ok(pass.report);
        }

        let mut report = pass.report;
        for kind in pass.triggers {
            if let Err(e) = self
                .automation
                .apply_trigger(&sequence, &enrollment, kind, now)
                .await
            {
                report.triggers_failed += 1;
                self.notify_automation_failed(FailedTrigger {
                    sequence_id: sequence.id,
                    enrollment_id: enrollment.id,
                    contact_id: enrollment.contact_id.clone(),
                    kind,
                    reason: e.to_string(),
                });
            }
        }
        Ok(report)
    }

    async fn run_claimed(
        &self,
        cache: &mut HashMap<Uuid, Arc<Sequence>>,
        enrollment: &mut Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Option<(Arc<Sequence>, Pass)>> {
        let sequence = self.sequence(cache, enrollment.sequence_id).await?;
        if !sequence.is_running() {
            return Ok(None);
        }
        let pass = self.drive(&sequence, enrollment, now).await?;
        Ok(Some((sequence, pass)))
    }

    /// Apply moves until the enrollment has nothing more to do right now.
    async fn drive(
        &self,
        sequence: &Sequence,
        e: &mut Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Pass> {
        let mut pass = Pass {
            report: TickReport::default(),
            triggers: Vec::new(),
            contact: None,
            sent: false,
        };
        let grace = chrono_duration(self.config.no_response_grace);

        loop {
            match e.next_move(sequence, now) {
                NextMove::Idle => break,
                NextMove::Admit => {
                    let Some(contact) = self.snapshot(e, &mut pass, now).await? else {
                        break;
                    };
                    let admission = criteria::admit(&contact, &sequence.spec.entering_criteria);
                    if admission.admitted {
                        e.admit(now)?;
                        pass.report.admitted += 1;
                        info!(enrollment_id = %e.id, contact_id = %e.contact_id, "Enrollment admitted");
                    } else {
                        let reason = admission.reason.unwrap_or_default();
                        e.remove(reason.clone(), now)?;
                        pass.report.skipped += 1;
                        self.notify(EngineNotice::Skipped {
                            sequence_id: sequence.id,
                            contact_id: e.contact_id.clone(),
                            reason,
                        });
                        break;
                    }
                }
                NextMove::Send { step, subject, body } => {
                    if pass.sent {
                        // One email per enrollment per pass.
                        break;
                    }
                    self.send(sequence, e, &mut pass, step, subject, body, now)
                        .await?;
                    if !pass.sent {
                        break;
                    }
                }
                NextMove::Wait { days } => {
                    let until = e.begin_wait(days, &sequence.spec.send_schedule, now)?;
                    pass.report.waiting += 1;
                    debug!(enrollment_id = %e.id, until = %until, "Waiting");
                    break;
                }
                NextMove::Wake => e.wake(now)?,
                NextMove::Complete => {
                    e.complete(grace, now)?;
                    pass.report.completed += 1;
                    info!(enrollment_id = %e.id, "Enrollment completed");
                }
                NextMove::ConcludeNoResponse => {
                    e.conclude_no_response(now)?;
                    pass.report.no_response += 1;
                    pass.triggers.push(TriggerKind::OnNoResponse);
                    self.notify(EngineNotice::NoResponse {
                        sequence_id: sequence.id,
                        enrollment_id: e.id,
                        contact_id: e.contact_id.clone(),
                    });
                    info!(enrollment_id = %e.id, "No response after grace period");
                    break;
                }
            }
        }
        Ok(pass)
    }

    /// Fetch (once per pass) the contact; a deleted contact removes the enrollment.
    async fn snapshot(
        &self,
        e: &mut Enrollment,
        pass: &mut Pass,
        now: DateTime<Utc>,
    ) -> Result<Option<ContactSnapshot>> {
        if let Some(contact) = &pass.contact {
            return Ok(Some(contact.clone()));
        }
        match self.contacts.get_snapshot(&e.contact_id).await {
            Ok(contact) => {
                pass.contact = Some(contact.clone());
                Ok(Some(contact))
            }
            Err(ContactStoreError::NotFound { contact_id }) => {
                e.remove("contact no longer exists", now)?;
                pass.report.skipped += 1;
                info!(enrollment_id = %e.id, contact_id = %contact_id, "Contact deleted; enrollment removed");
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        sequence: &Sequence,
        e: &mut Enrollment,
        pass: &mut Pass,
        step: usize,
        subject: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(contact) = self.snapshot(e, pass, now).await? else {
            return Ok(());
        };

        let rendered = match render_email(subject, body, &contact) {
            Ok(rendered) => rendered,
            Err(err) => {
                self.block_render(sequence, e, pass, err.to_string(), now);
                return Ok(());
            }
        };
        let Some(to) = contact.email_address().map(str::to_string) else {
            let reason = DispatchError::NoRecipient {
                contact_id: contact.id.clone(),
            }
            .to_string();
            self.block_render(sequence, e, pass, reason, now);
            return Ok(());
        };

        let reservation = match self.limiter.try_reserve(&e.sender_id, e.id, now).await? {
            ReserveOutcome::Reserved(reservation) => reservation,
            ReserveOutcome::Deferred { until, reason } => {
                e.defer(until, reason, now);
                pass.report.deferred += 1;
                debug!(enrollment_id = %e.id, until = %until, reason = reason.as_str(), "Send deferred");
                return Ok(());
            }
        };

        let email = OutboundEmail {
            enrollment_id: e.id,
            sequence_id: sequence.id,
            sender_id: e.sender_id.clone(),
            contact_id: e.contact_id.clone(),
            to,
            subject: rendered.subject,
            body: rendered.body,
        };

        let result = match tokio::time::timeout(self.config.send_timeout, self.mailer.send(&email)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                contact_id: e.contact_id.clone(),
                timeout: self.config.send_timeout,
            }),
        };

        match result {
            Ok(()) => {
                e.record_sent(
                    sequence.step_count(),
                    chrono_duration(self.config.no_response_grace),
                    now,
                )?;
                pass.sent = true;
                pass.report.sent += 1;
                info!(enrollment_id = %e.id, step, sender = %e.sender_id, "Email dispatched");
                if e.state == EnrollmentState::Completed {
                    pass.report.completed += 1;
                }
            }
            Err(err) => {
                self.limiter.release(&reservation).await?;
                let attempt = e.consecutive_failures + 1;
                let delay = with_jitter(backoff_delay(
                    self.config.retry_backoff_base,
                    self.config.retry_backoff_max,
                    attempt,
                ));
                let retry_at = now + chrono_duration(delay);
                let reason = err.to_string();
                let bounced =
                    e.record_failure(reason.clone(), self.config.max_send_attempts, retry_at, now)?;

                if bounced {
                    pass.report.bounced += 1;
                    pass.triggers.push(TriggerKind::OnBounced);
                    warn!(enrollment_id = %e.id, attempts = attempt, error = %err, "Giving up; enrollment bounced");
                    self.notify(EngineNotice::Bounced {
                        sequence_id: sequence.id,
                        enrollment_id: e.id,
                        contact_id: e.contact_id.clone(),
                        reason,
                    });
                } else {
                    pass.report.deferred += 1;
                    warn!(enrollment_id = %e.id, attempt, retry_at = %retry_at, error = %err, "Send failed; will retry");
                    self.notify(EngineNotice::DispatchFailed {
                        sequence_id: sequence.id,
                        enrollment_id: e.id,
                        contact_id: e.contact_id.clone(),
                        attempt,
                        reason,
                        retry_at,
                    });
                }
            }
        }
        Ok(())
    }

    fn block_render(
        &self,
        sequence: &Sequence,
        e: &mut Enrollment,
        pass: &mut Pass,
        reason: String,
        now: DateTime<Utc>,
    ) {
        let retry_at = now + chrono_duration(self.config.render_retry_delay);
        e.flag_for_review(reason.clone(), retry_at, now);
        pass.report.deferred += 1;
        warn!(enrollment_id = %e.id, reason = %reason, "Send held for review");
        self.notify(EngineNotice::RenderBlocked {
            sequence_id: sequence.id,
            enrollment_id: e.id,
            contact_id: e.contact_id.clone(),
            reason,
        });
    }
}

/// Spawn the background ticker. The first pass runs immediately.
pub fn spawn_ticker(scheduler: Arc<Scheduler>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.tick(Utc::now()).await {
                error!(error = %e, "Tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(300));
        assert_eq!(backoff_delay(base, max, 60), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_a_tenth() {
        let delay = Duration::from_secs(100);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay && jittered <= Duration::from_secs(110));
        }
    }

    #[test]
    fn report_merge_adds_fields() {
        let mut total = TickReport::default();
        assert!(total.is_empty());
        total.merge(&TickReport {
            sent: 2,
            deferred: 1,
            ..Default::default()
        });
        total.merge(&TickReport {
            sent: 1,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(total.sent, 3);
        assert_eq!(total.deferred, 1);
        assert_eq!(total.failed, 1);
    }

    #[test]
    fn automation_failure_notice_names_the_trigger() {
        let notice = EngineNotice::AutomationFailed {
            sequence_id: Uuid::nil(),
            enrollment_id: Uuid::nil(),
            contact_id: "c1".into(),
            trigger: TriggerKind::OnBounced,
            reason: "503".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "automation_failed");
        assert_eq!(json["trigger"], "onBounced");
    }

    #[test]
    fn notice_serializes_with_type_tag() {
        let notice = EngineNotice::NoResponse {
            sequence_id: Uuid::nil(),
            enrollment_id: Uuid::nil(),
            contact_id: "c1".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "no_response");
        assert_eq!(notice.sequence_id(), Uuid::nil());
    }
}
