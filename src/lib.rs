//! Access-governance core of a browser shell: the navigation allow/block
//! decision, the dynamic site registry with its verification jobs, the
//! punitive restriction ledger for deleted sites, and the debounced event bus
//! the rest of the shell listens on.

pub mod access;
pub mod config;
pub mod events;
pub mod hosts;
pub mod ledger;
pub mod sites;
pub mod state;
pub mod storage;
pub mod tab;

pub use access::{AccessLists, AccessPolicy};
pub use config::GateConfig;
pub use events::{EventBus, EventFilter, EventKind, ShellEvent};
pub use ledger::RestrictionLedger;
pub use sites::{AddSiteError, SiteCoordinator};
pub use state::AppState;
