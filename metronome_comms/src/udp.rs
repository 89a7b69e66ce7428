//! UDP transport: one datagram carries one ActionMessage.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle, time::timeout};

use metronome_core::{
    command::{protocol, Action, ActionMessage},
    RouteId,
};

use crate::{
    defaults::DEFAULT_UDP_PORT,
    interface::{CommsConfig, CommsDriver, CommsState, ConnectionStatus, DriverContext, TxQueue},
    network::{extract_interface_and_port, make_port_address, strip_protocol, NetworkCommsData},
};

/// The shutdown sentinel datagram.
const CLOSE_DATAGRAM: &[u8] = b"close";

type SharedNet = Arc<Mutex<NetworkCommsData>>;

pub struct UdpComms {
    pub net: NetworkCommsData,
}

impl Default for UdpComms {
    fn default() -> Self {
        UdpComms::new()
    }
}

impl UdpComms {
    pub fn new() -> Self {
        UdpComms { net: NetworkCommsData::new(DEFAULT_UDP_PORT) }
    }

    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.net.set_broker_port(port);
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.net.set_port(port);
        self
    }
}

impl CommsDriver for UdpComms {
    fn start(self, ctx: DriverContext) -> (JoinHandle<()>, Option<JoinHandle<()>>) {
        let DriverContext { state, tx_queue, control_to_rx, control_rx } = ctx;
        let net: SharedNet = Arc::new(Mutex::new(self.net));
        let single = state.config().single_thread;

        let tx_fut = run_transmitter(state.clone(), net.clone(), tx_queue, control_to_rx);
        let rx_fut = run_receiver(state, net, control_rx);
        if single {
            let handle = tokio::spawn(async move {
                tokio::join!(tx_fut, rx_fut);
            });
            (handle, None)
        } else {
            (tokio::spawn(tx_fut), Some(tokio::spawn(rx_fut)))
        }
    }
}

fn encode_datagram(cmd: &ActionMessage, json: bool) -> Vec<u8> {
    if json {
        cmd.to_json_string().into_bytes()
    } else {
        cmd.to_bytes()
    }
}

fn decode_datagram(data: &[u8]) -> Option<ActionMessage> {
    if data.first() == Some(&b'{') {
        ActionMessage::from_json(data).ok()
    } else {
        ActionMessage::from_bytes(data).ok()
    }
}

async fn resolve(address: &str) -> Option<SocketAddr> {
    tokio::net::lookup_host(address).await.ok().and_then(|mut addrs| addrs.next())
}

async fn negotiate_ports(
    socket: &UdpSocket,
    state: &CommsState,
    net: &SharedNet,
    config: &CommsConfig,
    broker_addr: &mut SocketAddr,
    control_to_rx: &mpsc::UnboundedSender<ActionMessage>,
) -> bool {
    let max_retries = net.lock().expect("net poisoned").max_retries;
    let mut attempts = 0u32;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        if state.disconnect_requested() {
            return false;
        }
        let request = {
            let net = net.lock().expect("net poisoned");
            let req = net.generate_port_request(config, if config.server_mode { 2 } else { 1 });
            encode_datagram(&req, net.use_json_serialization)
        };
        if socket.send_to(&request, *broker_addr).await.is_err() {
            attempts += 1;
            if attempts > max_retries {
                return false;
            }
            continue;
        }
        match timeout(config.connection_timeout, socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, _from))) => {
                let Some(reply) = decode_datagram(&buffer[..len]) else { continue };
                if !reply.is_protocol_command() {
                    continue;
                }
                match reply.message_id {
                    protocol::PORT_DEFINITIONS => {
                        let _ = control_to_rx.send(reply);
                        return true;
                    }
                    protocol::NEW_BROKER_INFORMATION => {
                        let redirect = reply
                            .string_data
                            .first()
                            .map(String::as_str)
                            .unwrap_or_else(|| reply.payload.to_str().unwrap_or(""));
                        if let Some((host, port)) = extract_interface_and_port(redirect) {
                            let host = if host == "?" { broker_addr.ip().to_string() } else { host.to_string() };
                            if let Some(addr) = resolve(&make_port_address(&host, port)).await {
                                *broker_addr = addr;
                            }
                        }
                    }
                    protocol::DELAY_CONNECTION => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    protocol::NAME_NOT_FOUND | protocol::DISCONNECT_ERROR => return false,
                    protocol::DISCONNECT => return false,
                    _ => {}
                }
            }
            _ => {
                attempts += 1;
                if attempts > max_retries {
                    tracing::error!("udp port negotiation timed out after {max_retries} attempts");
                    return false;
                }
            }
        }
    }
}

async fn run_transmitter(
    state: Arc<CommsState>,
    net: SharedNet,
    mut tx_queue: TxQueue,
    control_to_rx: mpsc::UnboundedSender<ActionMessage>,
) {
    let config = state.config();
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!("unable to open udp transmit socket: {err}");
            let _ = control_to_rx.send(ActionMessage::protocol(protocol::DISCONNECT_ERROR));
            state.set_tx_status(ConnectionStatus::Errored);
            return;
        }
    };

    let has_broker = !config.broker_target.is_empty();
    let mut broker_addr: Option<SocketAddr> = None;
    if has_broker {
        let broker_port = net.lock().expect("net poisoned").broker_port_or_default();
        let target = make_port_address(strip_protocol(&config.broker_target), broker_port);
        broker_addr = resolve(&target).await;
        let Some(mut addr) = broker_addr else {
            tracing::error!(%target, "unable to resolve broker address");
            let _ = control_to_rx.send(ActionMessage::protocol(protocol::DISCONNECT_ERROR));
            state.set_tx_status(ConnectionStatus::Errored);
            return;
        };
        if net.lock().expect("net poisoned").port_number.is_none() {
            if !negotiate_ports(&socket, &state, &net, &config, &mut addr, &control_to_rx).await {
                let msg = if state.disconnect_requested() {
                    ActionMessage::protocol(protocol::DISCONNECT)
                } else {
                    ActionMessage::protocol(protocol::DISCONNECT_ERROR)
                };
                let status = if state.disconnect_requested() {
                    ConnectionStatus::Terminated
                } else {
                    ConnectionStatus::Errored
                };
                let _ = control_to_rx.send(msg);
                state.set_tx_status(status);
                return;
            }
        }
        broker_addr = Some(addr);
    } else if net.lock().expect("net poisoned").port_number.is_none() {
        let default = net.lock().expect("net poisoned").default_broker_port();
        let mut setports = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
        setports.extra_data = i32::from(default);
        let _ = control_to_rx.send(setports);
    }

    state.set_tx_status(ConnectionStatus::Connected);
    let mut routes: HashMap<RouteId, SocketAddr> = HashMap::new();
    let json = net.lock().expect("net poisoned").use_json_serialization;

    while let Some((route, cmd)) = tx_queue.pop().await {
        if cmd.is_protocol_command() && route == RouteId::CONTROL {
            match cmd.message_id {
                protocol::RECONNECT_TRANSMITTER => {
                    state.set_tx_status(ConnectionStatus::Connected);
                    continue;
                }
                protocol::NEW_ROUTE => {
                    let target = cmd.payload.to_str().unwrap_or("").to_string();
                    match resolve(&target).await {
                        Some(addr) => {
                            routes.insert(RouteId(cmd.extra_data), addr);
                        }
                        None => tracing::error!(%target, "unable to resolve route address"),
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

        let destination = if route == RouteId::PARENT {
            broker_addr
        } else if route == RouteId::CONTROL {
            let _ = control_to_rx.send(cmd);
            continue;
        } else {
            routes.get(&route).copied().or(broker_addr)
        };
        match destination {
            Some(addr) => {
                if let Err(err) = socket.send_to(&encode_datagram(&cmd, json), addr).await {
                    tracing::error!("udp transmit failed: {err}");
                }
            }
            None => {
                if !cmd.is_ignoreable_command() {
                    tracing::warn!("unknown route and no broker, dropping message {cmd}");
                }
            }
        }
    }

    // wake the receive loop out of its socket read
    if state.rx_status() == ConnectionStatus::Connected {
        let port = net.lock().expect("net poisoned").port_number;
        if let Some(port) = port {
            let _ = socket.send_to(CLOSE_DATAGRAM, ("127.0.0.1", port)).await;
        }
    }
    state.set_tx_status(ConnectionStatus::Terminated);
}

async fn run_receiver(
    state: Arc<CommsState>,
    net: SharedNet,
    mut control_rx: mpsc::UnboundedReceiver<ActionMessage>,
) {
    let config = state.config();

    while net.lock().expect("net poisoned").port_number.is_none() {
        match control_rx.recv().await {
            Some(msg) if msg.is_protocol_command() => match msg.message_id {
                protocol::PORT_DEFINITIONS => {
                    net.lock().expect("net poisoned").load_port_definitions(&msg);
                }
                protocol::DISCONNECT | protocol::CLOSE_RECEIVER => {
                    state.set_rx_status(ConnectionStatus::Terminated);
                    return;
                }
                protocol::DISCONNECT_ERROR | protocol::NAME_NOT_FOUND => {
                    state.set_rx_status(ConnectionStatus::Errored);
                    return;
                }
                _ => {}
            },
            Some(_) => {}
            None => {
                state.set_rx_status(ConnectionStatus::Terminated);
                return;
            }
        }
    }

    let host = {
        let local = strip_protocol(&config.local_target);
        if local.is_empty() || local == "*" || local == "localhost" {
            "0.0.0.0".to_string()
        } else {
            local.to_string()
        }
    };
    let socket = loop {
        let (port, auto_port) = {
            let net = net.lock().expect("net poisoned");
            (net.port_number.expect("port assigned before bind"), net.auto_port_number)
        };
        match UdpSocket::bind((host.as_str(), port)).await {
            Ok(socket) => break socket,
            Err(err) => {
                if auto_port && !config.server_mode {
                    net.lock().expect("net poisoned").port_number = Some(port + 1);
                    continue;
                }
                tracing::error!(port, "unable to bind udp receiver: {err}");
                state.set_rx_status(ConnectionStatus::Errored);
                return;
            }
        }
    };
    state.set_rx_status(ConnectionStatus::Connected);

    let json = net.lock().expect("net poisoned").use_json_serialization;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::error!("udp receive failed: {err}");
                        continue;
                    }
                };
                if &buffer[..len] == CLOSE_DATAGRAM {
                    break;
                }
                let Some(cmd) = decode_datagram(&buffer[..len]) else {
                    tracing::warn!(?from, "undecodable datagram dropped");
                    continue;
                };
                if cmd.is_protocol_command() {
                    let reply = net
                        .lock()
                        .expect("net poisoned")
                        .generate_reply_to_incoming_message(&cmd);
                    if reply.action != Action::Ignore {
                        let _ = socket.send_to(&encode_datagram(&reply, json), from).await;
                    } else if matches!(
                        cmd.message_id,
                        protocol::CLOSE_RECEIVER | protocol::DISCONNECT
                    ) {
                        break;
                    } else {
                        state.deliver(cmd);
                    }
                } else {
                    state.deliver(cmd);
                }
            }
            ctl = control_rx.recv() => {
                match ctl {
                    Some(msg) if msg.is_protocol_command() => match msg.message_id {
                        protocol::CLOSE_RECEIVER | protocol::DISCONNECT => break,
                        protocol::RECONNECT_RECEIVER => {
                            state.set_rx_status(ConnectionStatus::Connected);
                        }
                        _ => {}
                    },
                    Some(msg) => state.deliver(msg),
                    None => break,
                }
            }
        }
    }
    state.set_rx_status(ConnectionStatus::Terminated);
}
