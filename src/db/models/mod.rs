pub mod caregiver;
pub mod dose;

pub use caregiver::CaregiverLink;
pub use dose::{DoseOutcome, DoseRecord, DoseStatus, IntakeContext, SlotBucket};
