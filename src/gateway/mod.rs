pub mod caregiver;
pub mod repository;

pub use caregiver::{
    CaregiverChannel, CaregiverMessage, CaregiverNotifier, LogChannel, MemoryCaregiverNotifier,
};
pub use repository::{DoseRepository, MemoryDoseRepository};
