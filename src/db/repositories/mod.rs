mod caregivers;
mod doses;

pub use caregivers::SqliteCaregiverNotifier;
