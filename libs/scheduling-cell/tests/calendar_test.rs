use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use tokio::sync::Notify;
use uuid::Uuid;

use patient_cell::{PatientSummary, StaticPatientDirectory};
use scheduling_cell::models::{
    Occurrence, OccurrenceData, OccurrenceForm, OccurrenceStatus, OccurrenceType, PaymentStatus,
};
use scheduling_cell::services::recurrence::{RecurrenceRule, Termination};
use scheduling_cell::{
    BroadcastNotificationDispatcher, CalendarDependencies, CalendarOrchestrator, FetchOutcome,
    InMemoryOccurrenceStore, InMemorySeriesStore, OccurrenceEventKind, OccurrenceStore,
    SchedulingError, SeriesStore, StoreError,
};
use shared_config::CalendarSettings;
use therapist_cell::{StaticTherapistDirectory, Therapist};

/// Delegates to an in-memory store but can hold the next list or create
/// call until the test releases it.
struct GatedStore {
    inner: Arc<InMemoryOccurrenceStore>,
    hold_list: AtomicBool,
    hold_create: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    fn new(inner: Arc<InMemoryOccurrenceStore>) -> Self {
        Self {
            inner,
            hold_list: AtomicBool::new(false),
            hold_create: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    async fn pause_if(&self, flag: &AtomicBool) {
        if flag.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl OccurrenceStore for GatedStore {
    async fn list_occurrences(
        &self,
        therapist_ids: Option<&[Uuid]>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        self.pause_if(&self.hold_list).await;
        self.inner.list_occurrences(therapist_ids, range_start, range_end).await
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError> {
        self.inner.get_occurrence(id).await
    }

    async fn list_series_occurrences(&self, series_id: Uuid, from: DateTime<Utc>) -> Result<Vec<Occurrence>, StoreError> {
        self.inner.list_series_occurrences(series_id, from).await
    }

    async fn create_occurrence(&self, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        self.pause_if(&self.hold_create).await;
        self.inner.create_occurrence(data).await
    }

    async fn update_occurrence(&self, id: Uuid, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        self.inner.update_occurrence(id, data).await
    }

    async fn delete_occurrence(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_occurrence(id).await
    }

    async fn delete_occurrences_from(&self, series_id: Uuid, pivot: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.delete_occurrences_from(series_id, pivot).await
    }
}

struct Clinic {
    store: Arc<InMemoryOccurrenceStore>,
    series: Arc<InMemorySeriesStore>,
    notifier: Arc<BroadcastNotificationDispatcher>,
    calendar: Arc<CalendarOrchestrator>,
    ana: Therapist,
    bruno: Therapist,
    patient: PatientSummary,
}

impl Clinic {
    fn new() -> Self {
        Self::build(InMemoryOccurrenceStore::new(), None, CalendarSettings::default())
    }

    fn build(store: InMemoryOccurrenceStore, gate: Option<&dyn Fn(Arc<InMemoryOccurrenceStore>) -> Arc<dyn OccurrenceStore>>, settings: CalendarSettings) -> Self {
        let store = Arc::new(store);
        let series = Arc::new(InMemorySeriesStore::new());
        let notifier = Arc::new(BroadcastNotificationDispatcher::default());
        let ana = Therapist::new(Uuid::new_v4(), "Ana Souza", "teal");
        let bruno = Therapist::new(Uuid::new_v4(), "Bruno Lima", "amber");
        let patient = PatientSummary {
            id: Uuid::new_v4(),
            first_name: "Clara".to_string(),
            last_name: "Mendes".to_string(),
            avatar_url: None,
            phone_number: Some("+55 11 99999-0000".to_string()),
        };

        let occurrences: Arc<dyn OccurrenceStore> = match gate {
            Some(wrap) => wrap(store.clone()),
            None => store.clone(),
        };
        let deps = CalendarDependencies {
            occurrences,
            series: series.clone(),
            therapists: Arc::new(StaticTherapistDirectory::new(vec![ana.clone(), bruno.clone()])),
            patients: Arc::new(StaticPatientDirectory::new(vec![patient.clone()])),
            notifier: notifier.clone(),
        };
        let calendar = CalendarOrchestrator::new(deps, &settings, date(2025, 3, 12)).unwrap();

        Self {
            store,
            series,
            notifier,
            calendar: Arc::new(calendar),
            ana,
            bruno,
            patient,
        }
    }

    fn form(&self, day: u32, hour: u32, minute: u32, minutes: u32) -> OccurrenceForm {
        OccurrenceForm {
            therapist_id: Some(self.ana.id),
            patient_id: Some(self.patient.id),
            date: Some(date(2025, 3, day)),
            start_time: NaiveTime::from_hms_opt(hour, minute, 0),
            duration_minutes: Some(minutes),
            ..Default::default()
        }
    }

    async fn book(&self, therapist: Uuid, patient: Uuid, start: DateTime<Utc>, minutes: i64) -> Occurrence {
        let occurrence = Occurrence {
            id: Uuid::new_v4(),
            therapist_id: therapist,
            patient_id: patient,
            start_time: start,
            end_time: start + Duration::minutes(minutes),
            occurrence_type: OccurrenceType::Session,
            status: OccurrenceStatus::Scheduled,
            series_id: None,
            is_series_exception: false,
            notes: None,
            value: None,
            payment_status: PaymentStatus::Pending,
            created_at: start,
            updated_at: start,
        };
        self.store.insert(occurrence.clone()).await;
        occurrence
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
}

fn weekly_monday(termination: Termination) -> RecurrenceRule {
    RecurrenceRule::weekly(vec![Weekday::Mon], NaiveTime::MIN, 1, termination)
}

#[tokio::test]
async fn overlapping_booking_for_the_same_therapist_is_rejected() {
    let clinic = Clinic::new();
    let existing = clinic.book(clinic.ana.id, Uuid::new_v4(), at(10, 10, 30), 60).await;
    clinic.calendar.refresh().await.unwrap();

    let result = clinic.calendar.create_or_update_occurrence(clinic.form(10, 10, 0, 60), false).await;

    assert_matches!(result, Err(SchedulingError::HardConflict { conflicting: Some(ref clash), .. }) if clash.id == existing.id);
    assert_eq!(clinic.calendar.occurrences().await, vec![existing]);
    assert_eq!(clinic.store.all().await.len(), 1);
}

#[tokio::test]
async fn back_to_back_bookings_do_not_conflict() {
    let clinic = Clinic::new();
    clinic.book(clinic.ana.id, Uuid::new_v4(), at(10, 10, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();

    let outcome = clinic.calendar.create_or_update_occurrence(clinic.form(10, 11, 0, 60), false).await.unwrap();

    assert!(outcome.warnings.is_empty());
    assert_eq!(clinic.calendar.occurrences().await.len(), 2);
}

#[tokio::test]
async fn patient_booked_with_another_therapist_is_a_warning() {
    let clinic = Clinic::new();
    let elsewhere = clinic.book(clinic.bruno.id, clinic.patient.id, at(10, 10, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();

    let outcome = clinic.calendar.create_or_update_occurrence(clinic.form(10, 10, 30, 30), false).await.unwrap();

    assert_eq!(outcome.occurrences.len(), 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].occurrence.id, elsewhere.id);
}

#[tokio::test]
async fn failed_save_restores_the_previous_occurrences() {
    let clinic = Clinic::new();
    clinic.book(clinic.ana.id, clinic.patient.id, at(11, 9, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();
    let before = clinic.calendar.occurrences().await;

    clinic.store.set_fail_writes(true);
    let result = clinic.calendar.create_or_update_occurrence(clinic.form(12, 9, 0, 60), false).await;

    assert_matches!(result, Err(SchedulingError::StoreFailure(_)));
    assert_eq!(clinic.calendar.occurrences().await, before);
    assert!(!clinic.calendar.view().await.saving);
}

#[tokio::test]
async fn storage_constraint_rejection_is_a_hard_conflict() {
    let clinic = Clinic::build(InMemoryOccurrenceStore::with_exclusion_constraint(), None, CalendarSettings::default());
    clinic.calendar.refresh().await.unwrap();

    // Booked by someone else after this week was loaded.
    clinic.book(clinic.ana.id, Uuid::new_v4(), at(10, 10, 0), 60).await;

    let result = clinic.calendar.create_or_update_occurrence(clinic.form(10, 10, 15, 30), false).await;

    assert_matches!(result, Err(SchedulingError::HardConflict { conflicting: None, .. }));
    assert!(clinic.calendar.occurrences().await.is_empty());
}

#[tokio::test]
async fn stale_fetch_is_discarded_after_navigation() {
    let gated: std::cell::OnceCell<Arc<GatedStore>> = std::cell::OnceCell::new();
    let wrap = |inner: Arc<InMemoryOccurrenceStore>| -> Arc<dyn OccurrenceStore> {
        let store = gated.get_or_init(|| Arc::new(GatedStore::new(inner)));
        store.clone()
    };
    let clinic = Clinic::build(InMemoryOccurrenceStore::new(), Some(&wrap), CalendarSettings::default());
    let gate = gated.get().unwrap().clone();

    clinic.book(clinic.ana.id, clinic.patient.id, at(11, 9, 0), 60).await;
    let next_week = clinic.book(clinic.ana.id, clinic.patient.id, at(18, 9, 0), 60).await;

    gate.hold_list.store(true, Ordering::SeqCst);
    let calendar = clinic.calendar.clone();
    let slow = tokio::spawn(async move { calendar.refresh().await });
    gate.entered.notified().await;

    assert_eq!(clinic.calendar.navigate_week(1).await.unwrap(), FetchOutcome::Applied);
    gate.release.notify_one();

    assert_eq!(slow.await.unwrap().unwrap(), FetchOutcome::Discarded);
    assert_eq!(clinic.calendar.week_start().await, date(2025, 3, 17));
    assert_eq!(clinic.calendar.occurrences().await, vec![next_week]);
}

#[tokio::test]
async fn second_save_for_the_same_slot_is_rejected_while_the_first_is_pending() {
    let gated: std::cell::OnceCell<Arc<GatedStore>> = std::cell::OnceCell::new();
    let wrap = |inner: Arc<InMemoryOccurrenceStore>| -> Arc<dyn OccurrenceStore> {
        let store = gated.get_or_init(|| Arc::new(GatedStore::new(inner)));
        store.clone()
    };
    let clinic = Clinic::build(InMemoryOccurrenceStore::new(), Some(&wrap), CalendarSettings::default());
    let gate = gated.get().unwrap().clone();
    clinic.calendar.refresh().await.unwrap();

    gate.hold_create.store(true, Ordering::SeqCst);
    let calendar = clinic.calendar.clone();
    let form = clinic.form(12, 14, 0, 50);
    let first = tokio::spawn({
        let form = form.clone();
        async move { calendar.create_or_update_occurrence(form, false).await }
    });
    gate.entered.notified().await;

    let view = clinic.calendar.view().await;
    assert!(view.saving);
    assert!(view.cards().any(|card| card.pending));

    let second = clinic.calendar.create_or_update_occurrence(form, false).await;
    assert_matches!(second, Err(SchedulingError::SaveInFlight(_)));

    gate.release.notify_one();
    let saved = first.await.unwrap().unwrap();

    assert_eq!(clinic.calendar.occurrences().await, saved.occurrences);
    assert!(!clinic.calendar.view().await.saving);
}

#[tokio::test]
async fn series_actions_need_a_series() {
    let clinic = Clinic::new();
    let single = clinic.book(clinic.ana.id, clinic.patient.id, at(11, 9, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();

    assert_matches!(
        clinic.calendar.delete_occurrence(single.id, true).await,
        Err(SchedulingError::InvalidOperation(_))
    );

    let mut edit = clinic.form(11, 10, 0, 60);
    edit.occurrence_id = Some(single.id);
    assert_matches!(
        clinic.calendar.create_or_update_occurrence(edit, true).await,
        Err(SchedulingError::InvalidOperation(_))
    );

    assert_matches!(
        clinic.calendar.create_or_update_occurrence(clinic.form(12, 10, 0, 60), true).await,
        Err(SchedulingError::InvalidOperation(_))
    );

    assert_eq!(clinic.store.all().await, vec![single]);
}

#[tokio::test]
async fn incomplete_or_empty_bookings_fail_validation() {
    let clinic = Clinic::new();

    let mut missing_patient = clinic.form(12, 9, 0, 60);
    missing_patient.patient_id = None;
    assert_matches!(
        clinic.calendar.create_or_update_occurrence(missing_patient, false).await,
        Err(SchedulingError::Validation(ref message)) if message.contains("patient")
    );

    assert_matches!(
        clinic.calendar.create_or_update_occurrence(clinic.form(12, 9, 0, 0), false).await,
        Err(SchedulingError::Validation(_))
    );
    assert!(clinic.store.all().await.is_empty());
}

#[tokio::test]
async fn navigating_forward_generates_the_next_series_members() {
    let settings = CalendarSettings {
        lookahead_weeks: 1,
        ..CalendarSettings::default()
    };
    let clinic = Clinic::build(InMemoryOccurrenceStore::new(), None, settings);
    clinic.calendar.refresh().await.unwrap();

    let mut form = clinic.form(10, 10, 0, 50);
    form.recurrence = Some(weekly_monday(Termination::Indefinite));
    let created = clinic.calendar.create_or_update_occurrence(form, false).await.unwrap();

    let series = created.series.unwrap();
    assert_eq!(created.occurrences.len(), 2);
    assert!(created.occurrences.iter().all(|o| o.duration_minutes() == 50));

    clinic.calendar.navigate_week(2).await.unwrap();

    let shown = clinic.calendar.occurrences().await;
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].start_time, at(24, 10, 0));
    assert_eq!(shown[0].series_id, Some(series.id));
    assert_eq!(clinic.store.all().await.len(), 4);
}

#[tokio::test]
async fn deleting_from_a_series_member_removes_the_rest() {
    let clinic = Clinic::new();
    let mut form = clinic.form(10, 10, 0, 50);
    form.recurrence = Some(weekly_monday(Termination::Count(4)));
    let created = clinic.calendar.create_or_update_occurrence(form, false).await.unwrap();
    assert_eq!(created.occurrences.len(), 4);

    let removed = clinic.calendar.delete_occurrence(created.occurrences[1].id, true).await.unwrap();

    assert_eq!(removed, 3);
    assert_eq!(clinic.store.all().await, vec![created.occurrences[0].clone()]);
}

#[tokio::test]
async fn canceling_a_series_member_detaches_it() {
    let clinic = Clinic::new();
    let mut form = clinic.form(10, 10, 0, 50);
    form.recurrence = Some(weekly_monday(Termination::Count(2)));
    let created = clinic.calendar.create_or_update_occurrence(form, false).await.unwrap();
    let series_id = created.series.unwrap().id;

    let canceled = clinic.calendar
        .update_status(created.occurrences[0].id, OccurrenceStatus::Canceled)
        .await
        .unwrap();

    assert_eq!(canceled.status, OccurrenceStatus::Canceled);
    assert!(canceled.is_series_exception);
    let series = clinic.series.get_series(series_id).await.unwrap().unwrap();
    assert!(series.exceptions.contains(&date(2025, 3, 10)));
}

#[tokio::test]
async fn finished_occurrences_cannot_be_reopened() {
    let clinic = Clinic::new();
    let booked = clinic.book(clinic.ana.id, clinic.patient.id, at(11, 9, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();

    let done = clinic.calendar.update_status(booked.id, OccurrenceStatus::Completed).await.unwrap();
    assert_eq!(done.status, OccurrenceStatus::Completed);

    assert_matches!(
        clinic.calendar.update_status(booked.id, OccurrenceStatus::Scheduled).await,
        Err(SchedulingError::InvalidStatusTransition { .. })
    );
}

#[tokio::test]
async fn week_view_places_cards_in_therapist_columns() {
    let clinic = Clinic::new();
    let first = clinic.book(clinic.ana.id, clinic.patient.id, at(10, 9, 0), 60).await;
    let second = clinic.book(clinic.ana.id, Uuid::new_v4(), at(10, 9, 30), 60).await;
    clinic.calendar.refresh().await.unwrap();

    let view = clinic.calendar.view().await;
    assert_eq!(view.week_start, date(2025, 3, 10));
    assert_eq!(view.days.len(), 7);
    assert_eq!(view.columns.len(), 2);

    let monday = &view.columns[0].days[0];
    assert_eq!(view.columns[0].therapist.id, clinic.ana.id);
    assert_eq!(monday.cards.len(), 2);

    let card = &monday.cards[0];
    assert_eq!(card.occurrence_id, first.id);
    assert_eq!(card.top_px, 240.0);
    assert_eq!(card.height_px, 120.0);
    assert_eq!((card.lane, card.lane_count), (0, 2));
    assert_eq!(card.color, "teal");
    assert_eq!(card.patient.as_ref().map(|p| p.full_name()), Some("Clara Mendes".to_string()));

    assert_eq!(monday.cards[1].occurrence_id, second.id);
    assert_eq!((monday.cards[1].lane, monday.cards[1].lane_count), (1, 2));
    assert_eq!(clinic.calendar.audit().await.len(), 1);

    assert!(view.columns[1].days.iter().all(|day| day.cards.is_empty()));
}

#[tokio::test]
async fn selection_and_filter_are_reflected_in_the_view() {
    let clinic = Clinic::new();
    let booked = clinic.book(clinic.ana.id, clinic.patient.id, at(11, 9, 0), 60).await;
    clinic.calendar.refresh().await.unwrap();

    clinic.calendar.select_occurrence(booked.id).await.unwrap();
    assert_eq!(clinic.calendar.view().await.selected_occurrence_id, Some(booked.id));
    clinic.calendar.clear_selection().await;
    assert_eq!(clinic.calendar.view().await.selected_occurrence_id, None);

    clinic.calendar.set_therapist_filter(Some(vec![clinic.bruno.id])).await.unwrap();
    let view = clinic.calendar.view().await;
    assert_eq!(view.columns.len(), 1);
    assert_eq!(view.columns[0].therapist.id, clinic.bruno.id);
    assert!(clinic.calendar.occurrences().await.is_empty());
}

#[tokio::test]
async fn jump_to_today_moves_back_to_the_current_week() {
    let clinic = Clinic::new();
    clinic.calendar.navigate_week(-3).await.unwrap();
    assert_eq!(clinic.calendar.week_start().await, date(2025, 2, 17));

    clinic.calendar.jump_to_today(date(2025, 3, 13)).await.unwrap();
    assert_eq!(clinic.calendar.week_start().await, date(2025, 3, 10));
}

#[tokio::test]
async fn saved_booking_is_announced() {
    let clinic = Clinic::new();
    let mut events = clinic.notifier.subscribe();

    let outcome = clinic.calendar.create_or_update_occurrence(clinic.form(12, 9, 0, 60), false).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, OccurrenceEventKind::Created);
    assert_eq!(event.occurrence_id, Some(outcome.occurrences[0].id));
}

#[tokio::test]
async fn series_edit_with_empty_notes_clears_them_on_every_later_member() {
    let clinic = Clinic::new();
    let mut form = clinic.form(10, 10, 0, 50);
    form.notes = Some("bring referral".to_string());
    form.recurrence = Some(weekly_monday(Termination::Count(3)));
    let created = clinic.calendar.create_or_update_occurrence(form, false).await.unwrap();
    let series_id = created.series.unwrap().id;

    let mut edit = clinic.form(10, 10, 0, 50);
    edit.occurrence_id = Some(created.occurrences[0].id);
    edit.notes = None;
    let edited = clinic.calendar.create_or_update_occurrence(edit, true).await.unwrap();

    assert_eq!(edited.occurrences.len(), 3);
    assert!(clinic.store.all().await.iter().all(|o| o.notes.is_none()));
    let series = clinic.series.get_series(series_id).await.unwrap().unwrap();
    assert_eq!(series.notes, None);
}

#[tokio::test]
async fn series_edit_rejects_changes_it_cannot_apply() {
    let clinic = Clinic::new();
    let mut form = clinic.form(10, 10, 0, 50);
    form.recurrence = Some(weekly_monday(Termination::Count(3)));
    let created = clinic.calendar.create_or_update_occurrence(form, false).await.unwrap();
    let before = clinic.store.all().await;

    let mut priced = clinic.form(10, 10, 0, 50);
    priced.occurrence_id = Some(created.occurrences[0].id);
    priced.value = Some(180.0);
    assert_matches!(
        clinic.calendar.create_or_update_occurrence(priced, true).await,
        Err(SchedulingError::Validation(ref message)) if message.contains("value")
    );

    let mut retyped = clinic.form(10, 10, 0, 50);
    retyped.occurrence_id = Some(created.occurrences[0].id);
    retyped.occurrence_type = OccurrenceType::Evaluation;
    assert_matches!(
        clinic.calendar.create_or_update_occurrence(retyped, true).await,
        Err(SchedulingError::Validation(ref message)) if message.contains("type")
    );

    let mut paid = clinic.form(10, 10, 0, 50);
    paid.occurrence_id = Some(created.occurrences[0].id);
    paid.payment_status = PaymentStatus::Paid;
    assert_matches!(
        clinic.calendar.create_or_update_occurrence(paid, true).await,
        Err(SchedulingError::Validation(ref message)) if message.contains("payment")
    );

    assert_eq!(clinic.store.all().await, before);
    assert!(!clinic.calendar.view().await.saving);
}
