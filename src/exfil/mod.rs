//! Exfiltration monitoring
//!
//! ```text
//! response ──► cooldown? ──► CounterStore (tenant, session, resource)
//!                                  │
//!                   volume / enumeration / destination
//!                                  │
//!                 Allow ◄──────────┴──────────► Block + critical incident + cooldown
//! ```

pub mod monitor;
pub mod window;

pub use monitor::{
    Anomaly, ExfilDecision, ExfiltrationConfig, ExfiltrationMonitor, OutboundChannel,
    OutboundResponse,
};
pub use window::{CounterKey, CounterStore, Observation, WindowCounterStore, WindowSnapshot};
