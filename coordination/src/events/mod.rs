//! Event-driven observation of the handoff coordinator
//!
//! The coordinator publishes a [`HandoffEvent`] for every decision, every
//! finalized execution, every reclaimed lease and every calibration. The bus
//! is fire-and-forget: no component waits on subscribers.
//!
//! ```ignore
//! use handoff_coordination::events::{EventBus, EventFilter};
//!
//! let bus = EventBus::new().shared();
//! let mut decisions = bus.subscribe_filtered(EventFilter::new().types(vec!["decision_made"]));
//! let event = decisions.recv().await?;
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::HandoffEvent;
