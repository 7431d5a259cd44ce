//! Claim handoff and navigation automation
//!
//! A portal page hands a claim number to a claims application running in
//! another tab. The mediator owns that tab, the agent inside it drives the
//! search and menu navigation, and a shared store decides which request is
//! the latest so older runs stand down.

pub mod agent;
pub mod bridge_page;
pub mod bridge_tabs;
pub mod config;
pub mod errors;
pub mod extension_bridge;
pub mod form;
pub mod handoff;
pub mod interact;
pub mod mediator;
pub mod menu;
pub mod messages;
pub mod navigate;
pub mod page;
pub mod portal;
pub mod session;
pub mod settings;
pub mod store;
pub mod supervisor;
/// In-memory page, tab and clipboard fakes for driving the automation
/// without a browser.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wait;

pub use agent::TargetAgent;
pub use config::{HostConfig, HostSelectors, Timings};
pub use errors::{AutomationError, ErrorKind};
pub use mediator::Mediator;
pub use page::{ElementHandle, Page};
pub use portal::Portal;
pub use supervisor::RunOutcome;
