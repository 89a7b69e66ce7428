//! In-process transport: named queues inside one process.
//!
//! Used for single-process federations and tests. The registry is an
//! explicitly constructed runtime object; [`InprocNetwork::global`] offers
//! the default instance for entry points with nothing to thread it through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use tokio::{sync::mpsc, task::JoinHandle};

use metronome_core::{
    command::{protocol, ActionMessage},
    RouteId,
};

use crate::interface::{CommsDriver, CommsState, ConnectionStatus, DriverContext, TxQueue};

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ActionMessage>>>>;

/// A namespace of in-process comms endpoints.
#[derive(Debug, Clone, Default)]
pub struct InprocNetwork {
    registry: Registry,
}

impl InprocNetwork {
    pub fn new() -> Self {
        InprocNetwork::default()
    }

    /// The process-wide default network.
    pub fn global() -> InprocNetwork {
        static GLOBAL: OnceLock<InprocNetwork> = OnceLock::new();
        GLOBAL.get_or_init(InprocNetwork::new).clone()
    }

    fn register(&self, name: &str, sender: mpsc::UnboundedSender<ActionMessage>) -> bool {
        let mut registry = self.registry.lock().expect("inproc registry poisoned");
        if registry.contains_key(name) {
            return false;
        }
        registry.insert(name.to_string(), sender);
        true
    }

    fn unregister(&self, name: &str) {
        self.registry.lock().expect("inproc registry poisoned").remove(name);
    }

    fn lookup(&self, name: &str) -> Option<mpsc::UnboundedSender<ActionMessage>> {
        self.registry.lock().expect("inproc registry poisoned").get(name).cloned()
    }
}

pub struct InprocComms {
    network: InprocNetwork,
}

impl Default for InprocComms {
    fn default() -> Self {
        InprocComms { network: InprocNetwork::global() }
    }
}

impl InprocComms {
    pub fn new(network: InprocNetwork) -> Self {
        InprocComms { network }
    }
}

impl CommsDriver for InprocComms {
    fn start(self, ctx: DriverContext) -> (JoinHandle<()>, Option<JoinHandle<()>>) {
        let DriverContext { state, tx_queue, control_to_rx, control_rx } = ctx;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let config = state.config();
        let registered = self.network.register(&config.name, inbound_tx);
        if !registered {
            tracing::error!(name = %config.name, "inproc endpoint name already in use");
        }

        let rx_handle = tokio::spawn(run_receiver(
            state.clone(),
            self.network.clone(),
            registered,
            inbound_rx,
            control_rx,
        ));
        let tx_handle =
            tokio::spawn(run_transmitter(state, self.network.clone(), tx_queue, control_to_rx));
        (tx_handle, Some(rx_handle))
    }
}

async fn run_receiver(
    state: Arc<CommsState>,
    network: InprocNetwork,
    registered: bool,
    mut inbound: mpsc::UnboundedReceiver<ActionMessage>,
    mut control_rx: mpsc::UnboundedReceiver<ActionMessage>,
) {
    let config = state.config();
    if !registered {
        state.set_rx_status(ConnectionStatus::Errored);
        return;
    }
    state.set_rx_status(ConnectionStatus::Connected);
    loop {
        tokio::select! {
            msg = inbound.recv() => {
                match msg {
                    Some(cmd) if cmd.is_protocol_command() => match cmd.message_id {
                        protocol::CLOSE_RECEIVER | protocol::DISCONNECT => break,
                        _ => state.deliver(cmd),
                    },
                    Some(cmd) => state.deliver(cmd),
                    None => break,
                }
            }
            ctl = control_rx.recv() => {
                match ctl {
                    Some(cmd) if cmd.is_protocol_command() => match cmd.message_id {
                        protocol::CLOSE_RECEIVER | protocol::DISCONNECT => break,
                        protocol::RECONNECT_RECEIVER => {
                            state.set_rx_status(ConnectionStatus::Connected);
                        }
                        _ => {}
                    },
                    Some(cmd) => state.deliver(cmd),
                    None => break,
                }
            }
        }
    }
    network.unregister(&config.name);
    state.set_rx_status(ConnectionStatus::Terminated);
}

async fn run_transmitter(
    state: Arc<CommsState>,
    network: InprocNetwork,
    mut tx_queue: TxQueue,
    control_to_rx: mpsc::UnboundedSender<ActionMessage>,
) {
    let config = state.config();
    let has_broker = !config.broker_target.is_empty();

    state.set_tx_status(ConnectionStatus::Connected);
    let mut routes: HashMap<RouteId, mpsc::UnboundedSender<ActionMessage>> = HashMap::new();

    while let Some((route, cmd)) = tx_queue.pop().await {
        if cmd.is_protocol_command() && route == RouteId::CONTROL {
            match cmd.message_id {
                protocol::RECONNECT_TRANSMITTER => {
                    state.set_tx_status(ConnectionStatus::Connected);
                    continue;
                }
                protocol::NEW_ROUTE => {
                    let target = cmd.payload.to_str().unwrap_or("");
                    match network.lookup(target) {
                        Some(sender) => {
                            routes.insert(RouteId(cmd.extra_data), sender);
                        }
                        None => {
                            tracing::error!(%target, "no inproc endpoint with that name");
                        }
                    }
                    continue;
                }
                protocol::REMOVE_ROUTE => {
                    routes.remove(&RouteId(cmd.extra_data));
                    continue;
                }
                protocol::DISCONNECT => break,
                _ => {}
            }
        }

        if route == RouteId::CONTROL {
            let _ = control_to_rx.send(cmd);
            continue;
        }
        let sender = if route == RouteId::PARENT {
            if has_broker {
                network.lookup(&config.broker_target)
            } else {
                None
            }
        } else {
            routes.get(&route).cloned().or_else(|| {
                if has_broker {
                    network.lookup(&config.broker_target)
                } else {
                    None
                }
            })
        };
        match sender {
            Some(sender) => {
                if sender.send(cmd).is_err() {
                    tracing::warn!(%route, "inproc peer has shut down");
                }
            }
            None => {
                if !cmd.is_ignoreable_command() {
                    tracing::warn!("unknown route and no broker, dropping message {cmd}");
                }
            }
        }
    }

    if state.rx_status() == ConnectionStatus::Connected {
        let _ = control_to_rx.send(ActionMessage::protocol(protocol::CLOSE_RECEIVER));
    }
    state.set_tx_status(ConnectionStatus::Terminated);
}
