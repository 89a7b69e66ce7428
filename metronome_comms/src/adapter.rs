//! Binding of a comms interface to a core or broker kernel.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use metronome_core::{ActionMessage, RouteId};

use crate::interface::{CommsDriver, CommsInterface};

/// What the comms layer needs from a kernel: a place to push received
/// commands.
pub trait KernelRole: Send + Sync + 'static {
    fn queue_command(&self, cmd: ActionMessage);
    fn name(&self) -> &str;
}

/// Disconnect progression for [`CommsBroker`]: not started, in progress,
/// done, finalized.
const STAGE_IDLE: u8 = 0;
const STAGE_IN_PROGRESS: u8 = 1;
const STAGE_DONE: u8 = 2;
const STAGE_FINAL: u8 = 3;

/// Owns a comms interface on behalf of a kernel role, forwarding transmit
/// and route operations and delivering received commands into the role's
/// action queue. Disconnection is staged so concurrent teardown paths
/// collapse into one.
pub struct CommsBroker<D: CommsDriver, R: KernelRole> {
    comms: CommsInterface<D>,
    role: Arc<R>,
    disconnection_stage: AtomicU8,
}

impl<D: CommsDriver, R: KernelRole> CommsBroker<D, R> {
    pub fn new(driver: D, role: Arc<R>) -> Self {
        let comms = CommsInterface::new(driver);
        let sink = role.clone();
        comms.set_callback(move |cmd| sink.queue_command(cmd));
        CommsBroker { comms, role, disconnection_stage: AtomicU8::new(STAGE_IDLE) }
    }

    pub fn comms(&self) -> &CommsInterface<D> {
        &self.comms
    }

    pub fn comms_mut(&mut self) -> &mut CommsInterface<D> {
        &mut self.comms
    }

    pub fn role(&self) -> &Arc<R> {
        &self.role
    }

    pub async fn connect(&mut self) -> bool {
        self.comms.connect().await
    }

    /// Idempotent teardown; only the first caller drives the comms
    /// disconnect.
    pub async fn disconnect(&mut self) {
        if self
            .disconnection_stage
            .compare_exchange(STAGE_IDLE, STAGE_IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.comms.disconnect().await;
            self.disconnection_stage.store(STAGE_DONE, Ordering::Release);
        } else {
            // another path started the disconnect; wait for it to land
            while self.disconnection_stage.load(Ordering::Acquire) == STAGE_IN_PROGRESS {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }

    pub async fn try_reconnect(&mut self) -> bool {
        self.comms.reconnect().await
    }

    pub fn transmit(&self, route: RouteId, cmd: ActionMessage) {
        self.comms.transmit(route, cmd);
    }

    pub fn add_route(&self, route: RouteId, route_info: &str) {
        self.comms.add_route(route, route_info);
    }

    pub fn remove_route(&self, route: RouteId) {
        self.comms.remove_route(route);
    }

    /// Mark teardown complete; later disconnect calls become no-ops.
    pub fn finalize(&self) {
        let _ = self.disconnection_stage.compare_exchange(
            STAGE_DONE,
            STAGE_FINAL,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
