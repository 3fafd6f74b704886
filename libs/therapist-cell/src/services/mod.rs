pub mod directory;

pub use directory::{StaticTherapistDirectory, SupabaseTherapistDirectory, TherapistDirectory};
