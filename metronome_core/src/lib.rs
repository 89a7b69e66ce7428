//! Core value types shared by every layer of the metronome runtime: logical
//! time, peer and interface identifiers, the [`ActionMessage`] command record
//! that moves between cores, brokers, and comms layers, plus the two small
//! synchronization and storage primitives the comms layer is built on.

pub mod buffer;
pub mod command;
pub mod ids;
pub mod time;
pub mod trigger;

pub use buffer::SmallBuffer;
pub use command::{Action, ActionMessage, MessageFlags};
pub use ids::{GlobalFederateId, GlobalHandle, InterfaceHandle, RouteId};
pub use time::Time;
pub use trigger::TriggerVariable;
