pub mod config;
pub mod events;
mod locks;
pub mod policy;
pub mod scheduler;
pub mod state;

pub use config::{ReminderPolicy, SchedulerConfig, MAX_RETRIES};
pub use events::{ChangeBus, DoseEvent, Subscription};
pub use policy::{classify, AlertKind};
pub use scheduler::{DoseScheduler, DuePrompt, TickFailure, TickReport};
pub use state::{apply, DoseAction, DosePatch, Intent, Transition, Trigger};
