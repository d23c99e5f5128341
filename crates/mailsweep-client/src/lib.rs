pub mod browser;
pub mod lookup;

pub use browser::{ChromiumSession, ChromiumSessionFactory};
pub use lookup::{LOOKUP_INTERVAL, LookupOutcome, MinIntervalGate, Person, PersonLookup};
