pub mod calendar;
pub mod conflict;
pub mod lifecycle;
pub mod notification;
pub mod recurrence;
pub mod series;
pub mod store;
pub mod supabase_store;
pub mod time_grid;
