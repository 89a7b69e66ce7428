//! Metronome is a distributed co-simulation runtime: independently-written
//! simulators ("federates") join a federation through a core, cores connect
//! to brokers, and the runtime guarantees coordinated logical-time
//! advancement across the whole federation.
//!
//! ## Example
//!
//! Run a single-core federation entirely in process:
//!
//! ```no_run
//! use metronome::{
//!     core::Time,
//!     kernel::{Core, CoreConfig, FederateTimingConfig, IterationRequest},
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let core = Core::new(CoreConfig::standalone("demo"));
//! let fed = core.register_federate("sim1", FederateTimingConfig::default()).await?;
//! let publication = fed.register_publication("sim1_pub", "string", "").await?;
//! let input = fed.register_input("sim1_in").await?;
//! fed.add_subscription(input, "sim1_pub").await?;
//!
//! fed.enter_initializing().await?;
//! fed.enter_executing(IterationRequest::NoIterations).await?;
//! fed.publish(publication, "hello world").await?;
//! let grant = fed.request_time(Time::from_secs(50), IterationRequest::NoIterations).await?;
//! println!("granted {}", grant.time);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "runner")]
pub mod runner;

// Re-exports
pub use metronome_comms as comms;
pub use metronome_core as core;
pub use metronome_kernel as kernel;
