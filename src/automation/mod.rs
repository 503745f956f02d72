//! Email automation engine.
//!
//! A stored message flows through:
//! 1. **Dispatcher**: account filter, per-message lock, logging
//! 2. **Matcher**: picks the highest-priority enabled rule whose conditions all hold
//! 3. **Executor**: runs the rule's actions against the operation collection

pub mod conditions;
pub mod dispatcher;
pub mod executor;
pub mod matcher;
pub mod model;

pub use dispatcher::{
    AutomationDispatcher, DispatchOutcome, DispatchSummary, DispatcherShutdown, spawn_dispatcher,
};
pub use executor::{ActionExecutor, OperationSink};
pub use matcher::select_rule;
