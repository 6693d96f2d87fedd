//! Owned session handle.
//!
//! The snapshot lives in a `watch` channel. Every read goes through
//! [`SessionHandle::snapshot`] at the point of use, and every write happens
//! synchronously inside `send_if_modified`, so no field ever has two writers
//! and nobody acts on a copy taken before an `.await`.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::config::PolicyConfig;
use crate::guided_fix::context::{GuidedFixContext, RepairProblem};
use crate::guided_fix::event_bus::{EventBus, SessionNotice};
use crate::guided_fix::history::{HistoryEntry, SessionHistory};
use crate::guided_fix::machine::{IgnoreReason, StateMachine, Transition};
use crate::guided_fix::state::{GuidedFixEvent, GuidedFixState, RequestId};

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: GuidedFixState,
    pub context: GuidedFixContext,
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    tx: watch::Sender<SessionSnapshot>,
    machine: StateMachine,
    bus: EventBus,
    history: Option<Mutex<SessionHistory>>,
}

/// Bookkeeping for one applied transition, recorded after the write.
struct Applied {
    event: &'static str,
    before: GuidedFixState,
    after: SessionSnapshot,
}

impl SessionHandle {
    pub fn new(
        problem: RepairProblem,
        expected_item: Option<String>,
        policy: PolicyConfig,
        history: Option<SessionHistory>,
    ) -> Self {
        let mut context = GuidedFixContext::new(problem, expected_item);
        let request_id = context.mint_request_id();
        let snapshot = SessionSnapshot {
            state: GuidedFixState::LoadingPlan { request_id },
            context,
        };
        let (tx, _) = watch::channel(snapshot);
        if let Some(h) = &history {
            tracing::info!(session = %h.session_id, "guided-fix session created");
        }
        Self {
            inner: Arc::new(SessionInner {
                tx,
                machine: StateMachine::new(policy),
                bus: EventBus::new(),
                history: history.map(Mutex::new),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.tx.borrow().clone()
    }

    pub fn state(&self) -> GuidedFixState {
        self.inner.tx.borrow().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.tx.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.inner.machine.policy()
    }

    /// Apply one event. Returns whether it changed the session.
    pub fn dispatch(&self, event: GuidedFixEvent) -> bool {
        self.dispatch_all(vec![event]) > 0
    }

    /// Apply events in order as one atomic write. Returns how many applied.
    pub fn dispatch_all(&self, events: Vec<GuidedFixEvent>) -> usize {
        let machine = &self.inner.machine;
        let mut applied: Vec<Applied> = Vec::new();
        let mut stale: Vec<(RequestId, Option<RequestId>)> = Vec::new();

        self.inner.tx.send_if_modified(|snap| {
            for event in &events {
                match machine.reduce(&snap.state, &snap.context, event) {
                    Transition::Next { state, mut context } => {
                        // The scheduler's transient slot is not the reducer's to change.
                        context.analysis = snap.context.analysis.clone();
                        let before = std::mem::replace(&mut snap.state, state);
                        snap.context = context;
                        applied.push(Applied {
                            event: event.name(),
                            before,
                            after: snap.clone(),
                        });
                    }
                    Transition::Ignored(IgnoreReason::StaleRequest { active, received }) => {
                        stale.push((received, active));
                    }
                    Transition::Ignored(IgnoreReason::NotApplicable) => {
                        tracing::debug!(
                            event = event.name(),
                            state = ?snap.state.kind(),
                            "event not applicable, ignored"
                        );
                    }
                }
            }
            !applied.is_empty()
        });

        for (received, active) in stale {
            tracing::debug!(%received, ?active, "stale result discarded");
            self.inner
                .bus
                .publish(SessionNotice::StaleResponseDiscarded { received, active });
        }
        for record in &applied {
            self.after_transition(record);
        }
        applied.len()
    }

    fn after_transition(&self, record: &Applied) {
        let after = &record.after;
        tracing::info!(
            event = record.event,
            from = ?record.before.kind(),
            to = ?after.state.kind(),
            step = after.context.current_step_index,
            revision = after.context.plan_revision,
            "session transition"
        );

        if let Some(text) = narration(&record.before, after) {
            self.inner.bus.publish(SessionNotice::Narration { text });
        }
        if let Some(history) = &self.inner.history {
            if let Ok(mut h) = history.lock() {
                h.push(HistoryEntry {
                    ts: chrono::Utc::now().timestamp_millis(),
                    event: record.event.to_string(),
                    from: record.before.kind(),
                    to: after.state.kind(),
                    plan_revision: after.context.plan_revision,
                    step_index: after.context.current_step_index,
                    state: serde_json::to_value(&after.state).unwrap_or_default(),
                });
                if let Err(e) = h.flush() {
                    tracing::warn!(error = %e, "failed to write session history");
                }
            }
        }
    }

    // ── Scheduler-owned transient fields ──────────────────────────────────

    /// Claim the single analysis slot. Fails if a request is already in flight.
    pub fn begin_analysis(&self, request_id: RequestId) -> bool {
        self.inner.tx.send_if_modified(|snap| {
            let slot = &mut snap.context.analysis;
            if slot.is_analyzing {
                return false;
            }
            slot.is_analyzing = true;
            slot.request_id = Some(request_id);
            slot.abort = None;
            true
        })
    }

    pub fn attach_abort(&self, request_id: RequestId, handle: tokio::task::AbortHandle) {
        self.inner.tx.send_if_modified(|snap| {
            let slot = &mut snap.context.analysis;
            if slot.is_analyzing && slot.request_id == Some(request_id) {
                slot.abort = Some(Arc::new(handle));
                true
            } else {
                // The slot moved on before the handle arrived.
                handle.abort();
                false
            }
        });
    }

    /// Release the slot if it still belongs to `request_id`.
    pub fn finish_analysis(&self, request_id: RequestId) {
        self.inner.tx.send_if_modified(|snap| {
            let slot = &mut snap.context.analysis;
            if slot.request_id == Some(request_id) {
                slot.is_analyzing = false;
                slot.request_id = None;
                slot.abort = None;
                true
            } else {
                false
            }
        });
    }

    /// Abort whatever is in flight and release the slot.
    pub fn abort_analysis(&self) {
        self.inner.tx.send_if_modified(|snap| {
            let slot = &mut snap.context.analysis;
            if let Some(handle) = slot.abort.take() {
                handle.abort();
            }
            let was_busy = slot.is_analyzing;
            slot.is_analyzing = false;
            slot.request_id = None;
            was_busy
        });
    }

    pub fn is_analyzing(&self) -> bool {
        self.inner.tx.borrow().context.analysis.is_analyzing
    }
}

/// What the voice layer should say after a transition, if anything.
fn narration(before: &GuidedFixState, after: &SessionSnapshot) -> Option<String> {
    let state = &after.state;
    let ctx = &after.context;
    let same_place = before.kind() == state.kind() && before.step() == state.step();

    match state {
        GuidedFixState::StepActive { step, .. } => {
            // Coming back to a step the user already heard stays quiet.
            let returning = match before {
                GuidedFixState::StepCompletionSuggested { step: s, .. } => s == step,
                GuidedFixState::Paused { .. }
                | GuidedFixState::ListeningForQuestion { .. }
                | GuidedFixState::ProcessingQuestion { .. }
                | GuidedFixState::ShowingAnswer { .. } => true,
                _ => false,
            };
            if same_place || returning {
                return None;
            }
            let current = ctx.repair_steps.get(*step)?;
            let mut text = format!(
                "Step {} of {}. {}",
                step + 1,
                ctx.total_steps(),
                current.instruction
            );
            if let Some(note) = &current.safety_note {
                text.push_str(" Safety: ");
                text.push_str(note);
            }
            Some(text)
        }
        GuidedFixState::VerifyingIdentity { .. } if !same_place => {
            let expected = ctx.expected_item.as_deref()?;
            Some(format!("Point the camera at the {expected} so I can confirm it."))
        }
        GuidedFixState::StepCompletionSuggested { evidence, .. } => Some(match evidence {
            Some(ev) => format!("It looks like this step is done: {ev}. Confirm to move on."),
            None => "It looks like this step is done. Confirm to move on.".to_string(),
        }),
        GuidedFixState::Paused { reason } => match before {
            GuidedFixState::Paused { reason: prev } if prev == reason => None,
            _ => Some(reason.narration()),
        },
        GuidedFixState::ShowingAnswer { answer, .. } => Some(answer.clone()),
        GuidedFixState::SubstituteFound { item, substitute, reason, .. } => Some(
            format!("You can use {substitute} instead of {item}. {reason}")
                .trim_end()
                .to_string(),
        ),
        GuidedFixState::ShowingNewPlan { .. } => Some(format!(
            "I've updated the plan. It now has {} steps.",
            ctx.total_steps()
        )),
        GuidedFixState::SessionComplete if !same_place => {
            Some("That's the last step. Nice work, the repair is complete.".to_string())
        }
        GuidedFixState::Error { message, .. } if !same_place => Some(message.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, guidance, plan, problem};

    fn active_session() -> SessionHandle {
        testing::active_session(plan(3))
    }

    #[test]
    fn test_starts_loading_plan() {
        let session = SessionHandle::new(problem(), None, PolicyConfig::default(), None);
        assert!(matches!(session.state(), GuidedFixState::LoadingPlan { .. }));
    }

    #[tokio::test]
    async fn test_stale_dispatch_changes_nothing_and_is_reported() {
        let session = active_session();
        let mut notices = session.bus().subscribe();
        let before = session.snapshot();
        let mut watcher = session.subscribe();
        watcher.borrow_and_update();

        let stale = GuidedFixEvent::FrameAnalyzed {
            guidance: guidance(0.9, false, "Stop"),
            request_id: RequestId(999),
        };
        assert!(!session.dispatch(stale));
        assert!(!watcher.has_changed().unwrap());

        let after = session.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.context.current_guidance, before.context.current_guidance);
        assert!(matches!(
            notices.recv().await.unwrap(),
            SessionNotice::StaleResponseDiscarded { received: RequestId(999), .. }
        ));
    }

    #[test]
    fn test_analysis_slot_is_exclusive() {
        let session = active_session();
        assert!(session.begin_analysis(RequestId(10)));
        assert!(!session.begin_analysis(RequestId(11)));
        assert!(session.is_analyzing());

        // Releasing with the wrong id leaves the slot held.
        session.finish_analysis(RequestId(11));
        assert!(session.is_analyzing());
        session.finish_analysis(RequestId(10));
        assert!(!session.is_analyzing());
        assert!(session.begin_analysis(RequestId(12)));
    }

    #[test]
    fn test_reducer_does_not_touch_analysis_slot() {
        let session = active_session();
        assert!(session.begin_analysis(RequestId(50)));
        session.dispatch(GuidedFixEvent::UserPaused);
        assert!(session.is_analyzing());
        session.abort_analysis();
        assert!(!session.is_analyzing());
    }

    #[tokio::test]
    async fn test_new_step_is_narrated() {
        let session = SessionHandle::new(problem(), None, PolicyConfig::default(), None);
        let mut notices = session.bus().subscribe();
        session.dispatch(GuidedFixEvent::PermissionsGranted);
        let id = session.state().active_request().unwrap();
        session.dispatch(GuidedFixEvent::PlanReceived { steps: plan(3), request_id: id });
        assert_eq!(
            notices.recv().await.unwrap(),
            SessionNotice::Narration { text: "Step 1 of 3. Step 1 instruction".into() }
        );
    }

    #[test]
    fn test_history_records_transitions() {
        let dir = std::env::temp_dir().join(format!("guided_fix_session_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let history = SessionHistory::in_dir(dir.clone());
        let path = history.file_path().to_path_buf();

        let session = SessionHandle::new(problem(), None, PolicyConfig::default(), Some(history));
        session.dispatch(GuidedFixEvent::PermissionsGranted);
        session.dispatch(GuidedFixEvent::SessionStopped);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("SESSION_STOPPED"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
