//! Lead-nurturing automation — trigger-driven, multi-step communication
//! sequences with timed, conditionally gated steps for the fitness CRM.

pub mod clock;
pub mod condition;
pub mod engine;
pub mod executor;
pub mod lead_store;
pub mod metrics;
pub mod personalizer;
pub mod registry;
pub mod scheduler;
pub mod seed;
pub mod state_machine;
pub mod store;
pub mod trigger;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{NurtureEngine, NurtureEngineBuilder};
pub use lead_store::{InMemoryLeadStore, InMemoryUserDirectory, LeadFilter, LeadStore, UserDirectory};
pub use store::{AssignmentStore, InMemoryAssignmentStore};
