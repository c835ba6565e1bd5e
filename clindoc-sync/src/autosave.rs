//! Debounced draft saving
//!
//! Every edit marks the open draft dirty and restarts a single timer; when it
//! fires the draft is saved through the controller. A burst of edits inside the
//! debounce window therefore produces one save carrying the latest content.
//!
//! Saves run in the background. A save that completes after the user has
//! switched to another draft is not applied to the new one, and a save that
//! completes after further edits only contributes the server id.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::controller::SyncController;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use crate::ids::EntityKind;
use crate::model::{Encounter, SectionUpdate};

/// What a flush did
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Box<Encounter>),
    /// Nothing changed since the last save
    Unchanged,
    NoDraft,
}

#[derive(Debug, Default)]
struct DraftState {
    draft: Option<Encounter>,
    dirty: bool,
    last_saved: Option<DateTime<Utc>>,
    enabled: bool,
    /// Bumped on every edit and every draft switch
    generation: u64,
}

struct SchedulerInner {
    controller: Arc<SyncController>,
    events: Arc<dyn EventSink>,
    debounce: Duration,
    state: Mutex<DraftState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for AutoSaveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AutoSaveScheduler")
            .field("debounce", &self.inner.debounce)
            .field("draft", &state.draft.as_ref().map(|d| d.id.to_string()))
            .field("dirty", &state.dirty)
            .field("enabled", &state.enabled)
            .finish()
    }
}

impl AutoSaveScheduler {
    pub fn new(controller: Arc<SyncController>, events: Arc<dyn EventSink>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                controller,
                events,
                debounce,
                state: Mutex::new(DraftState {
                    enabled: true,
                    ..DraftState::default()
                }),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Make `encounter` the draft being edited. Unsaved edits to the previous
    /// draft are saved first; if that save fails the switch still happens.
    pub async fn open(&self, encounter: Encounter) {
        let previous_dirty = {
            let state = self.inner.state.lock();
            state
                .draft
                .as_ref()
                .is_some_and(|draft| draft.id != encounter.id && state.dirty)
        };
        if previous_dirty {
            self.cancel();
            if let Err(err) = self.flush().await {
                tracing::warn!(error = %err, "Previous draft not saved before switching");
            }
        }

        self.cancel();
        let mut state = self.inner.state.lock();
        tracing::debug!(entity_type = "encounter", entity_id = %encounter.id, "Opened draft");
        state.draft = Some(encounter);
        state.dirty = false;
        state.generation += 1;
    }

    /// Apply `change` to the open draft and schedule a save.
    ///
    /// # Errors
    ///
    /// `Validation` if no draft is open, `InvalidTransition` if it is signed.
    pub fn edit<F>(&self, change: F) -> SyncResult<()>
    where
        F: FnOnce(&mut Encounter),
    {
        {
            let mut state = self.inner.state.lock();
            let draft = state
                .draft
                .as_mut()
                .ok_or_else(|| SyncError::Validation("no draft is open".into()))?;
            if draft.is_signed() {
                return Err(SyncError::InvalidTransition(format!(
                    "encounter {} is signed; corrections must be amendments",
                    draft.id
                )));
            }

            let before = draft.clone();
            change(draft);
            if *draft == before {
                return Ok(());
            }
            let now = Utc::now();
            draft.soap.stamp_changed(&before.soap, now);
            draft.updated_at = now;

            state.dirty = true;
            state.generation += 1;
        }
        self.schedule();
        Ok(())
    }

    /// # Errors
    ///
    /// As [`Self::edit`].
    pub fn update_section(&self, update: SectionUpdate) -> SyncResult<()> {
        self.edit(|draft| update.apply_to(&mut draft.soap, Utc::now()))
    }

    /// Flag the open draft as needing a save without changing it.
    pub fn mark_dirty(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draft.is_none() {
                return;
            }
            state.dirty = true;
            state.generation += 1;
        }
        self.schedule();
    }

    /// Save now if there are unsaved edits.
    ///
    /// # Errors
    ///
    /// The controller's error; the draft stays dirty and a `NotSaved` event is
    /// emitted.
    pub async fn flush(&self) -> SyncResult<SaveOutcome> {
        flush_inner(&self.inner).await
    }

    /// Cancel the timer and save the draft even if it is clean.
    ///
    /// # Errors
    ///
    /// As [`Self::flush`].
    pub async fn save_now(&self) -> SyncResult<SaveOutcome> {
        self.cancel();
        {
            let mut state = self.inner.state.lock();
            if state.draft.is_some() {
                state.dirty = true;
            }
        }
        self.flush().await
    }

    /// Stop a pending timer. Unsaved edits stay dirty.
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let reschedule = {
            let mut state = self.inner.state.lock();
            state.enabled = enabled;
            enabled && state.dirty
        };
        if enabled {
            if reschedule {
                self.schedule();
            }
        } else {
            self.cancel();
        }
    }

    /// Save outstanding edits and forget the draft.
    ///
    /// # Errors
    ///
    /// As [`Self::flush`]; the draft stays open when the save fails.
    pub async fn close(&self) -> SyncResult<SaveOutcome> {
        self.cancel();
        let outcome = self.flush().await?;
        let mut state = self.inner.state.lock();
        state.draft = None;
        state.dirty = false;
        state.generation += 1;
        Ok(outcome)
    }

    /// Save outstanding edits, then sign the draft.
    ///
    /// # Errors
    ///
    /// `Validation` if no draft is open; otherwise as
    /// [`SyncController::sign_encounter`].
    pub async fn sign(&self, signer: &str) -> SyncResult<Encounter> {
        self.cancel();
        self.flush().await?;

        let id = self
            .draft()
            .map(|draft| draft.id)
            .ok_or_else(|| SyncError::Validation("no draft is open".into()))?;
        let signed = self.inner.controller.sign_encounter(&id, signer).await?;

        let mut state = self.inner.state.lock();
        if let Some(draft) = state.draft.as_mut() {
            if draft.id == id || draft.id == signed.id {
                *draft = signed.clone();
                state.dirty = false;
            }
        }
        Ok(signed)
    }

    pub fn draft(&self) -> Option<Encounter> {
        self.inner.state.lock().draft.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().dirty
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_saved
    }

    fn schedule(&self) {
        let generation = {
            let state = self.inner.state.lock();
            if !state.enabled || !state.dirty {
                return;
            }
            state.generation
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; draft will be saved on the next explicit flush");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.debounce;
        let mut timer = self.inner.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(runtime.spawn(fire_after(weak, debounce, generation)));
    }
}

async fn fire_after(weak: Weak<SchedulerInner>, debounce: Duration, generation: u64) {
    tokio::time::sleep(debounce).await;

    let Some(inner) = weak.upgrade() else {
        return;
    };
    {
        let mut timer = inner.timer.lock();
        if inner.state.lock().generation != generation {
            return;
        }
        // Detach our own handle so a later edit does not abort the save
        timer.take();
    }

    if let Err(err) = flush_inner(&inner).await {
        tracing::debug!(error = %err, "Autosave attempt failed");
    }
}

async fn flush_inner(inner: &SchedulerInner) -> SyncResult<SaveOutcome> {
    let (draft, generation) = {
        let mut state = inner.state.lock();
        let Some(draft) = state.draft.clone() else {
            return Ok(SaveOutcome::NoDraft);
        };
        if !state.dirty {
            return Ok(SaveOutcome::Unchanged);
        }
        state.dirty = false;
        (draft, state.generation)
    };
    let draft_id = draft.id.clone();

    match inner.controller.save_encounter(draft).await {
        Ok(saved) => {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            match state.draft.as_mut() {
                Some(current) if current.id == draft_id => {
                    if state.generation == generation {
                        *current = saved.clone();
                    } else {
                        // Newer edits are pending; only the id is news
                        current.id = saved.id.clone();
                    }
                    state.last_saved = Some(Utc::now());
                }
                _ => tracing::debug!(
                    entity_type = "encounter",
                    entity_id = %saved.id,
                    "Draft switched while saving; result not applied"
                ),
            }
            Ok(SaveOutcome::Saved(Box::new(saved)))
        }
        Err(err) => {
            {
                let mut state = inner.state.lock();
                if state.draft.as_ref().is_some_and(|current| current.id == draft_id) {
                    state.dirty = true;
                }
            }
            tracing::warn!(entity_type = "encounter", entity_id = %draft_id, error = %err, "Draft not saved");
            inner.events.emit(SyncEvent::NotSaved {
                kind: EntityKind::Encounter,
                id: draft_id,
                reason: err.to_string(),
            });
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use crate::ids::RecordId;
    use crate::local_cache::LocalCacheStore;
    use crate::model::EncounterType;
    use crate::remote::InMemoryRemoteApi;

    fn scheduler() -> AutoSaveScheduler {
        let controller = SyncController::new(
            Arc::new(InMemoryRemoteApi::new()),
            LocalCacheStore::in_memory(),
            Arc::new(NoopSink),
        )
        .unwrap();
        AutoSaveScheduler::new(Arc::new(controller), Arc::new(NoopSink), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_edit_without_draft_is_rejected() {
        let autosave = scheduler();
        assert!(matches!(autosave.edit(|_| {}), Err(SyncError::Validation(_))));
        assert_eq!(autosave.flush().await.unwrap(), SaveOutcome::NoDraft);
    }

    #[tokio::test]
    async fn test_noop_edit_does_not_dirty() {
        let autosave = scheduler();
        let draft = Encounter::draft(
            RecordId::confirmed("epi-1"),
            RecordId::confirmed("pat-1"),
            EncounterType::Initial,
        );
        autosave.open(draft).await;
        autosave.edit(|_| {}).unwrap();
        assert!(!autosave.is_dirty());
        assert_eq!(autosave.flush().await.unwrap(), SaveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_keeps_edits_dirty() {
        let autosave = scheduler();
        autosave.set_enabled(false);
        autosave
            .open(Encounter::draft(
                RecordId::confirmed("epi-1"),
                RecordId::confirmed("pat-1"),
                EncounterType::FollowUp,
            ))
            .await;
        autosave
            .edit(|draft| draft.soap.subjective.chief_complaint = "cough".into())
            .unwrap();
        assert!(autosave.is_dirty());
        assert!(autosave.inner.timer.lock().is_none());
        assert!(autosave.draft().unwrap().soap.subjective.updated_at.is_some());
    }
}
