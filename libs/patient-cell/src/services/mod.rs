pub mod directory;

pub use directory::{PatientDirectory, StaticPatientDirectory, SupabasePatientDirectory};
