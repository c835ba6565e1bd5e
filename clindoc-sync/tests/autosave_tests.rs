//! Debounced draft saving, on a paused clock

use clindoc_sync::remote::RemoteOp;
use clindoc_sync::{
    AutoSaveScheduler, BroadcastSink, Encounter, EncounterType, EntityKind, Episode, EpisodeCategory,
    InMemoryRemoteApi, LocalCacheStore, Patient, SaveOutcome, SyncController, SyncError, SyncEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const DEBOUNCE: Duration = Duration::from_secs(30);

struct Harness {
    remote: Arc<InMemoryRemoteApi>,
    sync: Arc<SyncController>,
    events: Arc<BroadcastSink>,
    autosave: AutoSaveScheduler,
    initial: Encounter,
    follow_up: Encounter,
}

async fn harness() -> Harness {
    let remote = Arc::new(InMemoryRemoteApi::new());
    let events = Arc::new(BroadcastSink::default());
    let sync = Arc::new(SyncController::new(remote.clone(), LocalCacheStore::in_memory(), events.clone()).unwrap());

    let patient = sync.create(Patient::intake("Ada", "Lovelace")).await.unwrap();
    let episode = sync
        .create(Episode::open(patient.id.clone(), "persistent cough", EpisodeCategory::Acute))
        .await
        .unwrap();
    let initial = sync
        .create_draft_encounter(&episode.id, &patient.id, EncounterType::Initial)
        .await
        .unwrap();
    let follow_up = sync
        .create_draft_encounter(&episode.id, &patient.id, EncounterType::FollowUp)
        .await
        .unwrap();

    let autosave = AutoSaveScheduler::new(sync.clone(), events.clone(), DEBOUNCE);
    Harness {
        remote,
        sync,
        events,
        autosave,
        initial,
        follow_up,
    }
}

fn set_complaint(autosave: &AutoSaveScheduler, text: &'static str) {
    autosave
        .edit(move |draft| draft.soap.subjective.chief_complaint = text.to_string())
        .unwrap();
}

fn stored(sync: &SyncController, id: &clindoc_sync::RecordId) -> Encounter {
    sync.collection::<Encounter>()
        .into_iter()
        .find(|encounter| &encounter.id == id)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_is_saved_once() {
    let h = harness().await;
    h.autosave.open(h.initial.clone()).await;

    for text in ["c", "co", "cough"] {
        set_complaint(&h.autosave, text);
        sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 0);

    sleep(DEBOUNCE + Duration::from_secs(1)).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 1);
    assert_eq!(stored(&h.sync, &h.initial.id).soap.subjective.chief_complaint, "cough");
    assert!(!h.autosave.is_dirty());
    assert!(h.autosave.last_saved().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_each_edit_restarts_the_window() {
    let h = harness().await;
    h.autosave.open(h.initial.clone()).await;

    set_complaint(&h.autosave, "fever");
    sleep(Duration::from_secs(20)).await;
    set_complaint(&h.autosave, "fever and chills");
    sleep(Duration::from_secs(20)).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 0);

    sleep(Duration::from_secs(15)).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_save_is_not_applied_to_the_next_draft() {
    let h = harness().await;
    h.remote.set_latency(RemoteOp::Replace, Duration::from_secs(5));
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "headache");

    // Save starts at 30s and completes at 35s
    sleep(DEBOUNCE + Duration::from_secs(1)).await;
    h.autosave.open(h.follow_up.clone()).await;
    sleep(Duration::from_secs(10)).await;

    let draft = h.autosave.draft().unwrap();
    assert_eq!(draft.id, h.follow_up.id);
    assert!(draft.soap.subjective.chief_complaint.is_empty());
    assert_eq!(stored(&h.sync, &h.initial.id).soap.subjective.chief_complaint, "headache");
}

#[tokio::test(start_paused = true)]
async fn test_edits_made_during_a_save_are_kept() {
    let h = harness().await;
    h.remote.set_latency(RemoteOp::Replace, Duration::from_secs(5));
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "one");

    sleep(DEBOUNCE + Duration::from_secs(1)).await;
    set_complaint(&h.autosave, "two");
    sleep(Duration::from_secs(10)).await;

    let draft = h.autosave.draft().unwrap();
    assert_eq!(draft.soap.subjective.chief_complaint, "two");
    assert!(h.autosave.is_dirty());
    assert_eq!(stored(&h.sync, &h.initial.id).soap.subjective.chief_complaint, "one");
}

#[tokio::test(start_paused = true)]
async fn test_switching_drafts_saves_the_previous_one() {
    let h = harness().await;
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "wheezing");

    h.autosave.open(h.follow_up.clone()).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 1);
    assert_eq!(stored(&h.sync, &h.initial.id).soap.subjective.chief_complaint, "wheezing");
    assert!(!h.autosave.is_dirty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_autosave_waits_for_reenable() {
    let h = harness().await;
    h.autosave.set_enabled(false);
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "dizziness");

    sleep(DEBOUNCE * 2).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 0);
    assert!(h.autosave.is_dirty());

    h.autosave.set_enabled(true);
    sleep(DEBOUNCE + Duration::from_secs(1)).await;
    assert_eq!(h.remote.request_count(RemoteOp::Replace), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_save_stays_dirty_and_is_reported() {
    let h = harness().await;
    let mut received = h.events.subscribe();
    h.autosave.open(h.initial.clone()).await;

    // Signed elsewhere while this copy was open
    h.sync.sign_encounter(&h.initial.id, "dr.osei").await.unwrap();
    set_complaint(&h.autosave, "too late");

    let result = h.autosave.flush().await;
    assert!(matches!(result, Err(SyncError::InvalidTransition(_))));
    assert!(h.autosave.is_dirty());

    let mut not_saved = None;
    while let Ok(event) = received.try_recv() {
        if let SyncEvent::NotSaved { kind, id, .. } = event {
            not_saved = Some((kind, id));
        }
    }
    assert_eq!(not_saved, Some((EntityKind::Encounter, h.initial.id.clone())));
}

#[tokio::test(start_paused = true)]
async fn test_sign_flushes_then_locks_the_draft() {
    let h = harness().await;
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "sore throat");

    let signed = h.autosave.sign("dr.osei").await.unwrap();
    assert!(signed.is_signed());
    assert_eq!(signed.soap.subjective.chief_complaint, "sore throat");
    assert!(h.autosave.draft().unwrap().is_signed());
    assert!(matches!(
        h.autosave.edit(|draft| draft.soap.plan.treatment = "rest".into()),
        Err(SyncError::InvalidTransition(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_saves_and_forgets() {
    let h = harness().await;
    h.autosave.open(h.initial.clone()).await;
    set_complaint(&h.autosave, "back pain");

    let outcome = h.autosave.close().await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Saved(_)));
    assert!(h.autosave.draft().is_none());
    assert_eq!(h.autosave.save_now().await.unwrap(), SaveOutcome::NoDraft);
}

#[tokio::test(start_paused = true)]
async fn test_draft_opened_before_another_screen_keeps_its_edits() {
    let h = harness().await;
    let patient_id = h.initial.patient_id.clone();
    let episode = h
        .sync
        .create(Episode::open(patient_id.clone(), "palpitations", EpisodeCategory::Acute))
        .await
        .unwrap();

    h.autosave
        .open(Encounter::draft(episode.id.clone(), patient_id.clone(), EncounterType::Initial))
        .await;
    set_complaint(&h.autosave, "chest pain");

    let other_screen = h
        .sync
        .create_draft_encounter(&episode.id, &patient_id, EncounterType::Initial)
        .await
        .unwrap();

    let outcome = h.autosave.save_now().await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Saved(_)));
    assert_eq!(stored(&h.sync, &other_screen.id).soap.subjective.chief_complaint, "chest pain");

    let draft = h.autosave.draft().unwrap();
    assert_eq!(draft.id, other_screen.id);
    assert_eq!(draft.soap.subjective.chief_complaint, "chest pain");
    assert!(!h.autosave.is_dirty());
    assert_eq!(h.sync.get_episode_encounters(&episode.id).len(), 1);
}
