//! Identifiers for federation peers, interfaces, and comms routes.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Global ids are assigned by the root broker from disjoint blocks so a bare
/// number identifies its kind.
const FEDERATE_ID_BASE: i32 = 0x0002_0000;
const BROKER_ID_BASE: i32 = 0x7000_0000;

/// Identifier of a federation peer (federate, core, or broker).
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GlobalFederateId(pub i32);

impl GlobalFederateId {
    pub const INVALID: GlobalFederateId = GlobalFederateId(i32::MIN);
    /// The root broker of a federation.
    pub const ROOT_BROKER: GlobalFederateId = GlobalFederateId(1);

    pub fn new_federate(index: i32) -> Self {
        GlobalFederateId(FEDERATE_ID_BASE + index)
    }

    pub fn new_broker(index: i32) -> Self {
        GlobalFederateId(BROKER_ID_BASE + index)
    }

    pub fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }

    pub fn is_broker(self) -> bool {
        self == Self::ROOT_BROKER || self.0 >= BROKER_ID_BASE
    }

    pub fn is_federate(self) -> bool {
        self.0 >= FEDERATE_ID_BASE && self.0 < BROKER_ID_BASE
    }
}

impl Display for GlobalFederateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_valid() {
            write!(f, "fed(invalid)")
        } else if self.is_broker() {
            write!(f, "brk({})", self.0)
        } else {
            write!(f, "fed({})", self.0)
        }
    }
}

/// Interface handle local to one federate.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct InterfaceHandle(pub i32);

impl InterfaceHandle {
    pub const INVALID: InterfaceHandle = InterfaceHandle(i32::MIN);

    pub fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }
}

/// Globally unique interface address: owning federate plus local handle.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalHandle {
    pub fed: GlobalFederateId,
    pub handle: InterfaceHandle,
}

impl GlobalHandle {
    pub fn new(fed: GlobalFederateId, handle: InterfaceHandle) -> Self {
        GlobalHandle { fed, handle }
    }
}

/// Identifier of a comms route inside one core or broker.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RouteId(pub i32);

impl RouteId {
    /// Route 0 sends toward the parent broker.
    pub const PARENT: RouteId = RouteId(0);
    /// Delivers into the owning comms interface's own receive loop.
    pub const CONTROL: RouteId = RouteId(-1);
    pub const INVALID: RouteId = RouteId(i32::MIN);

    pub fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }
}

impl Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RouteId::PARENT => write!(f, "route(parent)"),
            RouteId::CONTROL => write!(f, "route(control)"),
            RouteId(id) => write!(f, "route({id})"),
        }
    }
}
