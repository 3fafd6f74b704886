pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::SchedulingError;
pub use models::*;
pub use router::scheduling_routes;
pub use services::calendar::{CalendarDependencies, CalendarOrchestrator, FetchOutcome, SaveOutcome};
pub use services::notification::{BroadcastNotificationDispatcher, NotificationDispatcher, OccurrenceEvent, OccurrenceEventKind};
pub use services::store::{InMemoryOccurrenceStore, InMemorySeriesStore, OccurrenceStore, SeriesStore, StoreError};
pub use services::supabase_store::{DeletePolicy, SupabaseOccurrenceStore, SupabaseSeriesStore};
