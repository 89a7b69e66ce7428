//! Core and broker kernels of the metronome runtime.
//!
//! A [`Core`] hosts federates: it owns their time coordinators, interface
//! registrations, and value/message delivery. A [`Broker`] routes between
//! cores and other brokers and coordinates federation-wide lifecycle. Both
//! run as command-processing tasks fed by the comms layer and the local
//! API.

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod dependencies;
pub mod filter;
pub mod message;
pub mod query;
pub mod translator;

pub use self::broker::{Broker, BrokerConfig};
pub use self::config::FederateTimingConfig;
pub use self::coordinator::{IterationRequest, IterationState, TimeCoordinator};
pub use self::core::{Core, CoreConfig, Federate, TimeGrant};
pub use self::filter::{FilterOperator, FilterPlacement};
pub use self::message::EndpointMessage;
pub use self::query::QueryMode;
pub use self::translator::TranslatorOperator;

/// Failure kinds surfaced by the kernels.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid function call: {0}")]
    InvalidFunctionCall(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("registration failure: {0}")]
    RegistrationFailure(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("unknown federate or interface: {0}")]
    InvalidIdentifier(String),
    #[error("the federation has terminated: {0}")]
    SystemFailure(String),
    #[error("operation aborted")]
    UserAbort,
    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}
