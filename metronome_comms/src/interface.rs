//! The transport-independent half of every comms object: connection status
//! tracking, the transmit queue with its priority band, control-route
//! plumbing, and the connect/disconnect contracts.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};
use tokio::{sync::mpsc, sync::watch, task::JoinHandle};

use metronome_core::{
    command::{protocol, ActionMessage},
    RouteId, TriggerVariable,
};

use crate::tripwire;

/// Connection state of one side (transmit or receive) of a comms object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Startup,
    Connected,
    Reconnecting,
    Terminated,
    Errored,
}

impl ConnectionStatus {
    pub fn code(self) -> i8 {
        match self {
            ConnectionStatus::Startup => -1,
            ConnectionStatus::Connected => 0,
            ConnectionStatus::Reconnecting => 1,
            ConnectionStatus::Terminated => 2,
            ConnectionStatus::Errored => 4,
        }
    }

    /// Still starting up or live.
    pub fn is_active(self) -> bool {
        self.code() <= 0
    }
}

pub type ActionCallback = Arc<dyn Fn(ActionMessage) + Send + Sync>;

/// Settable configuration, writable only before the transmit side leaves
/// [`ConnectionStatus::Startup`].
#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub name: String,
    pub local_target: String,
    pub broker_target: String,
    pub broker_name: String,
    pub broker_init_string: String,
    pub connection_timeout: Duration,
    pub max_message_size: usize,
    pub server_mode: bool,
    pub observer: bool,
    /// The comm cannot operate without reaching its broker.
    pub require_broker_connection: bool,
    /// Linger before rebinding over a force-terminated occupant.
    pub force_linger: Duration,
    /// Run transmit and receive duties on a single task.
    pub single_thread: bool,
}

impl Default for CommsConfig {
    fn default() -> Self {
        CommsConfig {
            name: String::new(),
            local_target: String::new(),
            broker_target: String::new(),
            broker_name: String::new(),
            broker_init_string: String::new(),
            connection_timeout: Duration::from_secs(4),
            max_message_size: 16 * 1024 * 1024,
            server_mode: false,
            observer: false,
            require_broker_connection: false,
            force_linger: Duration::from_millis(1050),
            single_thread: false,
        }
    }
}

/// State shared between the kernel-facing interface and the driver tasks.
pub struct CommsState {
    /// Property lock: once set it stays set for the life of the connection.
    operating: AtomicBool,
    request_disconnect: AtomicBool,
    tx_status: watch::Sender<ConnectionStatus>,
    rx_status: watch::Sender<ConnectionStatus>,
    pub tx_trigger: TriggerVariable,
    pub rx_trigger: TriggerVariable,
    config: Mutex<CommsConfig>,
    random_id: Mutex<String>,
    callback: Mutex<Option<ActionCallback>>,
    trip: tripwire::Receiver,
}

impl std::fmt::Debug for CommsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommsState")
            .field("tx_status", &self.tx_status())
            .field("rx_status", &self.rx_status())
            .field("operating", &self.operating.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CommsState {
    fn new(trip: tripwire::Receiver) -> Self {
        CommsState {
            operating: AtomicBool::new(false),
            request_disconnect: AtomicBool::new(false),
            tx_status: watch::channel(ConnectionStatus::Startup).0,
            rx_status: watch::channel(ConnectionStatus::Startup).0,
            tx_trigger: TriggerVariable::new(),
            rx_trigger: TriggerVariable::new(),
            config: Mutex::new(CommsConfig::default()),
            random_id: Mutex::new(String::new()),
            callback: Mutex::new(None),
            trip,
        }
    }

    /// Acquire the property lock. Fails once the transmit side has left
    /// startup: from then on properties are frozen.
    pub fn property_lock(&self) -> bool {
        while self
            .operating
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if self.tx_status() != ConnectionStatus::Startup {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }

    pub fn property_unlock(&self) {
        let _ = self.operating.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_operating(&self) -> bool {
        self.operating.load(Ordering::Acquire)
    }

    pub fn tx_status(&self) -> ConnectionStatus {
        *self.tx_status.borrow()
    }

    pub fn rx_status(&self) -> ConnectionStatus {
        *self.rx_status.borrow()
    }

    pub fn disconnect_requested(&self) -> bool {
        self.request_disconnect.load(Ordering::Acquire)
    }

    pub fn is_tripped(&self) -> bool {
        self.trip.is_tripped()
    }

    pub fn config(&self) -> CommsConfig {
        self.config.lock().expect("comms config poisoned").clone()
    }

    pub fn random_id(&self) -> String {
        self.random_id.lock().expect("comms id poisoned").clone()
    }

    pub fn callback(&self) -> Option<ActionCallback> {
        self.callback.lock().expect("comms callback poisoned").clone()
    }

    /// Deliver an inbound message to the kernel.
    pub fn deliver(&self, msg: ActionMessage) {
        if let Some(callback) = self.callback() {
            callback(msg);
        }
    }

    /// Status transitions double as trigger pulses: reaching a terminal
    /// state from startup must both release `connect()` (activation) and
    /// release `disconnect()` (trigger).
    pub fn set_tx_status(&self, status: ConnectionStatus) {
        Self::set_status(&self.tx_status, &self.tx_trigger, status);
        if status != ConnectionStatus::Startup {
            tracing::debug!(?status, "comms tx status");
        }
    }

    pub fn set_rx_status(&self, status: ConnectionStatus) {
        Self::set_status(&self.rx_status, &self.rx_trigger, status);
        if status != ConnectionStatus::Startup {
            tracing::debug!(?status, "comms rx status");
        }
    }

    fn set_status(
        holder: &watch::Sender<ConnectionStatus>,
        trigger: &TriggerVariable,
        status: ConnectionStatus,
    ) {
        let previous = *holder.borrow();
        if previous == status {
            return;
        }
        match status {
            ConnectionStatus::Connected => {
                if previous == ConnectionStatus::Startup {
                    holder.send_replace(status);
                    trigger.activate();
                }
            }
            ConnectionStatus::Terminated | ConnectionStatus::Errored => {
                holder.send_replace(status);
                if previous == ConnectionStatus::Startup {
                    trigger.activate();
                }
                trigger.trigger();
            }
            _ => {
                holder.send_replace(status);
            }
        }
    }
}

/// Receiver half of the transmit queue; the priority band drains first.
pub struct TxQueue {
    priority: mpsc::UnboundedReceiver<(RouteId, ActionMessage)>,
    normal: mpsc::UnboundedReceiver<(RouteId, ActionMessage)>,
}

impl TxQueue {
    pub async fn pop(&mut self) -> Option<(RouteId, ActionMessage)> {
        if let Ok(item) = self.priority.try_recv() {
            return Some(item);
        }
        tokio::select! {
            biased;
            item = self.priority.recv() => item,
            item = self.normal.recv() => item,
        }
    }
}

/// Everything a transport driver needs to run its duties.
pub struct DriverContext {
    pub state: Arc<CommsState>,
    pub tx_queue: TxQueue,
    /// Transmit loop side of the control pipe into the receive loop.
    pub control_to_rx: mpsc::UnboundedSender<ActionMessage>,
    /// Receive loop end of the control pipe.
    pub control_rx: mpsc::UnboundedReceiver<ActionMessage>,
}

/// A concrete transport. `start` consumes the driver and spawns its
/// transmit (and, unless running single-threaded, receive) tasks.
pub trait CommsDriver: Send + Sized + 'static {
    fn start(self, ctx: DriverContext) -> (JoinHandle<()>, Option<JoinHandle<()>>);
}

/// Clonable transmit-side handle onto a comms interface, for kernels that
/// need to send from callbacks and spawned tasks.
#[derive(Clone)]
pub struct CommsHandle {
    priority_tx: mpsc::UnboundedSender<(RouteId, ActionMessage)>,
    normal_tx: mpsc::UnboundedSender<(RouteId, ActionMessage)>,
}

impl CommsHandle {
    pub fn transmit(&self, route: RouteId, cmd: ActionMessage) {
        let channel =
            if cmd.is_priority_command() { &self.priority_tx } else { &self.normal_tx };
        if channel.send((route, cmd)).is_err() {
            tracing::warn!("transmit on a comms interface whose driver has shut down");
        }
    }

    pub fn add_route(&self, route: RouteId, route_info: &str) {
        let mut cmd = ActionMessage::protocol_priority(protocol::NEW_ROUTE);
        cmd.payload = route_info.into();
        cmd.extra_data = route.0;
        self.transmit(RouteId::CONTROL, cmd);
    }

    pub fn remove_route(&self, route: RouteId) {
        let mut cmd = ActionMessage::protocol(protocol::REMOVE_ROUTE);
        cmd.extra_data = route.0;
        self.transmit(RouteId::CONTROL, cmd);
    }
}

/// The kernel-facing comms object.
pub struct CommsInterface<D: CommsDriver> {
    state: Arc<CommsState>,
    priority_tx: mpsc::UnboundedSender<(RouteId, ActionMessage)>,
    normal_tx: mpsc::UnboundedSender<(RouteId, ActionMessage)>,
    driver: Option<D>,
    queue: Option<TxQueue>,
    control_to_rx: Option<mpsc::UnboundedSender<ActionMessage>>,
    control_rx: Option<mpsc::UnboundedReceiver<ActionMessage>>,
    handles: Vec<JoinHandle<()>>,
}

impl<D: CommsDriver> CommsInterface<D> {
    pub fn new(driver: D) -> Self {
        Self::with_tripwire(driver, tripwire::global().subscribe())
    }

    pub fn with_tripwire(driver: D, trip: tripwire::Receiver) -> Self {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (control_to_rx, control_rx) = mpsc::unbounded_channel();
        CommsInterface {
            state: Arc::new(CommsState::new(trip)),
            priority_tx,
            normal_tx,
            driver: Some(driver),
            queue: Some(TxQueue { priority: priority_rx, normal: normal_rx }),
            control_to_rx: Some(control_to_rx),
            control_rx: Some(control_rx),
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> &Arc<CommsState> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.tx_status() == ConnectionStatus::Connected
            && self.state.rx_status() == ConnectionStatus::Connected
    }

    /// Mutate configuration under the property lock; a no-op once the
    /// interface is past startup.
    pub fn modify_config(&self, modify: impl FnOnce(&mut CommsConfig)) -> bool {
        if !self.state.property_lock() {
            return false;
        }
        modify(&mut self.state.config.lock().expect("comms config poisoned"));
        self.state.property_unlock();
        true
    }

    pub fn set_callback(&self, callback: impl Fn(ActionMessage) + Send + Sync + 'static) -> bool {
        if !self.state.property_lock() {
            return false;
        }
        *self.state.callback.lock().expect("comms callback poisoned") = Some(Arc::new(callback));
        self.state.property_unlock();
        true
    }

    pub fn set_name(&self, name: &str) -> bool {
        self.modify_config(|c| c.name = name.to_string())
    }

    pub fn load_target_info(&self, local_target: &str, broker_target: &str) -> bool {
        self.modify_config(|c| {
            c.local_target = local_target.to_string();
            c.broker_target = broker_target.to_string();
            c.require_broker_connection = !broker_target.is_empty();
        })
    }

    /// A clonable transmit handle for kernel callbacks and tasks.
    pub fn handle(&self) -> CommsHandle {
        CommsHandle { priority_tx: self.priority_tx.clone(), normal_tx: self.normal_tx.clone() }
    }

    /// Queue a message for transmission on `route`. Priority commands go to
    /// the priority band.
    pub fn transmit(&self, route: RouteId, cmd: ActionMessage) {
        self.handle().transmit(route, cmd);
    }

    /// Ask the transmit loop to open a route to the peer described by
    /// `route_info` (transport-specific address or name).
    pub fn add_route(&self, route: RouteId, route_info: &str) {
        self.handle().add_route(route, route_info);
    }

    pub fn remove_route(&self, route: RouteId) {
        self.handle().remove_route(route);
    }

    fn close_receiver(&self) {
        self.transmit(RouteId::CONTROL, ActionMessage::protocol(protocol::CLOSE_RECEIVER));
    }

    fn close_transmitter(&self) {
        self.transmit(RouteId::CONTROL, ActionMessage::protocol(protocol::DISCONNECT));
    }

    /// Bring the connection up.
    ///
    /// Spawns the driver tasks and waits until both sides have either
    /// connected or failed; on a half-connection the live side is torn back
    /// down. Properties stay locked from here on.
    pub async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.state.rx_status() != ConnectionStatus::Startup
            || self.state.tx_status() != ConnectionStatus::Startup
        {
            return false;
        }
        if self.state.callback().is_none() {
            tracing::error!("no action callback specified, the receiver cannot start");
            return false;
        }
        if !self.state.property_lock() {
            return self.is_connected();
        }
        {
            let mut config = self.state.config.lock().expect("comms config poisoned");
            if config.name.is_empty() {
                config.name = config.local_target.clone();
            }
            if config.local_target.is_empty() {
                config.local_target = config.name.clone();
            }
            let mut id = self.state.random_id.lock().expect("comms id poisoned");
            if id.is_empty() {
                *id = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(10)
                    .map(char::from)
                    .collect();
            }
        }
        // the property lock is deliberately left held

        let driver = match self.driver.take() {
            Some(driver) => driver,
            None => return false,
        };
        let ctx = DriverContext {
            state: self.state.clone(),
            tx_queue: self.queue.take().expect("connect may only consume the queue once"),
            control_to_rx: self.control_to_rx.take().expect("control pipe already taken"),
            control_rx: self.control_rx.take().expect("control pipe already taken"),
        };
        let (tx_handle, rx_handle) = driver.start(ctx);
        self.handles.push(tx_handle);
        if let Some(rx_handle) = rx_handle {
            self.handles.push(rx_handle);
        }

        self.state.tx_trigger.wait_activation().await;
        self.state.rx_trigger.wait_activation().await;

        if self.state.rx_status() != ConnectionStatus::Connected {
            if !self.state.disconnect_requested() {
                tracing::error!("receiver connection failure");
            }
            if self.state.tx_status() == ConnectionStatus::Connected {
                self.close_transmitter();
            }
            self.join_tasks().await;
            return false;
        }
        if self.state.tx_status() != ConnectionStatus::Connected {
            if !self.state.disconnect_requested() {
                tracing::error!("transmitter connection failure");
            }
            self.close_receiver();
            self.join_tasks().await;
            return false;
        }
        true
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&mut self) {
        if !self.state.is_operating() {
            if self.state.property_lock() {
                self.state.set_rx_status(ConnectionStatus::Terminated);
                self.state.set_tx_status(ConnectionStatus::Terminated);
                self.state.property_unlock();
                self.join_tasks().await;
                return;
            }
        }
        self.state.request_disconnect.store(true, Ordering::Release);

        if self.state.rx_status().is_active() {
            self.close_receiver();
        }
        if self.state.tx_status().is_active() {
            self.close_transmitter();
        }
        if self.state.is_tripped() {
            self.state.set_rx_status(ConnectionStatus::Terminated);
            self.state.set_tx_status(ConnectionStatus::Terminated);
            return;
        }

        let mut count = 0u32;
        while self.state.rx_status().is_active() {
            if self.state.rx_trigger.wait_for(Duration::from_millis(800)).await {
                continue;
            }
            count += 1;
            if count % 4 == 0 {
                // kick the receiver again every ~2400 ms
                self.close_receiver();
            }
            if count == 14 {
                tracing::error!("unable to terminate receiver connection");
                break;
            }
            if self.state.is_tripped() {
                self.state.set_rx_status(ConnectionStatus::Terminated);
                self.state.set_tx_status(ConnectionStatus::Terminated);
                return;
            }
        }
        count = 0;
        while self.state.tx_status().is_active() {
            if self.state.tx_trigger.wait_for(Duration::from_millis(800)).await {
                continue;
            }
            count += 1;
            if count % 4 == 0 {
                self.close_transmitter();
            }
            if count == 14 {
                tracing::error!("unable to terminate transmit connection");
                break;
            }
            if self.state.is_tripped() {
                self.state.set_rx_status(ConnectionStatus::Terminated);
                self.state.set_tx_status(ConnectionStatus::Terminated);
                return;
            }
        }
        self.join_tasks().await;
    }

    /// Attempt to re-establish a dropped connection in place.
    pub async fn reconnect(&mut self) -> bool {
        self.state.set_rx_status(ConnectionStatus::Reconnecting);
        self.state.set_tx_status(ConnectionStatus::Reconnecting);
        self.transmit(
            RouteId::CONTROL,
            ActionMessage::protocol(protocol::RECONNECT_RECEIVER),
        );
        self.transmit(
            RouteId::CONTROL,
            ActionMessage::protocol(protocol::RECONNECT_TRANSMITTER),
        );

        for side in ["receiver", "transmitter"] {
            let status = if side == "receiver" {
                &self.state.rx_status
            } else {
                &self.state.tx_status
            };
            let mut count = 0u32;
            while *status.borrow() == ConnectionStatus::Reconnecting {
                tokio::time::sleep(Duration::from_millis(50)).await;
                count += 1;
                if count == 400 {
                    tracing::error!("unable to reconnect {side}");
                    break;
                }
            }
        }
        self.is_connected()
    }

    async fn join_tasks(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
