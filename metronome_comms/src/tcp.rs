//! TCP transport: framed ActionMessage streams.
//!
//! The transmit side dials the broker, negotiates a local port block over
//! the broker connection, and materializes routes as outbound framed
//! streams. The receive side binds a listener on the negotiated port and
//! spawns one read task per inbound connection; bootstrap protocol commands
//! are answered in place, everything else is delivered to the kernel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;

use metronome_core::{
    command::{protocol, Action, ActionMessage},
    RouteId,
};

use crate::{
    codec::ActionCodec,
    defaults::DEFAULT_TCP_PORT,
    interface::{CommsConfig, CommsDriver, CommsState, ConnectionStatus, DriverContext, TxQueue},
    network::{extract_interface_and_port, make_port_address, strip_protocol, NetworkCommsData},
};

type SharedNet = Arc<Mutex<NetworkCommsData>>;
type TcpFrame = Framed<TcpStream, ActionCodec>;

pub struct TcpComms {
    pub net: NetworkCommsData,
}

impl Default for TcpComms {
    fn default() -> Self {
        TcpComms::new()
    }
}

impl TcpComms {
    pub fn new() -> Self {
        TcpComms { net: NetworkCommsData::new(DEFAULT_TCP_PORT) }
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

impl CommsDriver for TcpComms {
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

enum NegotiationError {
    Terminated,
    Failed,
}

/// Dial the broker and, when no local port is preassigned, run the
/// REQUEST_PORTS handshake. Handles broker redirects and delay requests.
async fn negotiate_broker_connection(
    state: &CommsState,
    net: &SharedNet,
    config: &CommsConfig,
    control_to_rx: &mpsc::UnboundedSender<ActionMessage>,
) -> Result<TcpFrame, NegotiationError> {
    let mut broker_host = strip_protocol(&config.broker_target).to_string();
    let mut broker_port = net.lock().expect("net poisoned").broker_port_or_default();
    let max_retries = net.lock().expect("net poisoned").max_retries;
    let mut connect_attempts = 0u32;

    'reconnect: loop {
        if state.disconnect_requested() {
            return Err(NegotiationError::Terminated);
        }
        let address = make_port_address(&broker_host, broker_port);
        let stream =
            match timeout(config.connection_timeout, TcpStream::connect(address.clone())).await {
                Ok(Ok(stream)) => stream,
                _ => {
                    connect_attempts += 1;
                    if connect_attempts == 1 {
                        tracing::warn!(%address, "broker connection timed out, trying again");
                    }
                    if connect_attempts > max_retries {
                        tracing::error!(
                            %address,
                            "broker connection timed out after {max_retries} attempts"
                        );
                        return Err(NegotiationError::Failed);
                    }
                    // a refused connection fails fast; don't spin
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };
        let json = net.lock().expect("net poisoned").use_json_serialization;
        let mut frame =
            Framed::new(stream, if json { ActionCodec::json() } else { ActionCodec::new() });

        if net.lock().expect("net poisoned").port_number.is_some() {
            return Ok(frame);
        }

        let mut request_attempts = 0u32;
        loop {
            if state.disconnect_requested() {
                return Err(NegotiationError::Terminated);
            }
            let request = {
                let net = net.lock().expect("net poisoned");
                net.generate_port_request(config, if config.server_mode { 2 } else { 1 })
            };
            if frame.send(request).await.is_err() {
                continue 'reconnect;
            }
            match timeout(config.connection_timeout, frame.next()).await {
                Ok(Some(Ok(reply))) if reply.is_protocol_command() => match reply.message_id {
                    protocol::PORT_DEFINITIONS => {
                        // the receive loop loads the definitions and binds
                        let _ = control_to_rx.send(reply);
                        return Ok(frame);
                    }
                    protocol::NEW_BROKER_INFORMATION => {
                        tracing::info!("got new broker information");
                        let redirect = reply
                            .string_data
                            .first()
                            .map(String::as_str)
                            .unwrap_or_else(|| reply.payload.to_str().unwrap_or(""));
                        match extract_interface_and_port(redirect) {
                            Some((host, port)) => {
                                if host != "?" {
                                    broker_host = host.to_string();
                                }
                                broker_port = port;
                            }
                            None => {
                                tracing::error!(%redirect, "unusable broker redirect address");
                                return Err(NegotiationError::Failed);
                            }
                        }
                        continue 'reconnect;
                    }
                    protocol::DELAY_CONNECTION => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    protocol::NAME_NOT_FOUND => {
                        tracing::error!(
                            broker = %config.broker_name,
                            "broker name does not match broker connection"
                        );
                        return Err(NegotiationError::Failed);
                    }
                    protocol::DISCONNECT => return Err(NegotiationError::Terminated),
                    protocol::DISCONNECT_ERROR => return Err(NegotiationError::Failed),
                    _ => {}
                },
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(err))) => {
                    tracing::error!("broker connection decode error: {err}");
                    return Err(NegotiationError::Failed);
                }
                Ok(None) => continue 'reconnect,
                Err(_) => {
                    request_attempts += 1;
                    if request_attempts > max_retries {
                        tracing::error!(
                            "port negotiation timed out after {max_retries} attempts"
                        );
                        return Err(NegotiationError::Failed);
                    }
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
    let has_broker = !config.broker_target.is_empty();
    let mut broker_frame: Option<TcpFrame> = None;

    if has_broker {
        match negotiate_broker_connection(&state, &net, &config, &control_to_rx).await {
            Ok(frame) => broker_frame = Some(frame),
            Err(NegotiationError::Terminated) => {
                let _ = control_to_rx.send(ActionMessage::protocol(protocol::DISCONNECT));
                state.set_tx_status(ConnectionStatus::Terminated);
                return;
            }
            Err(NegotiationError::Failed) => {
                let _ = control_to_rx.send(ActionMessage::protocol(protocol::DISCONNECT_ERROR));
                state.set_tx_status(ConnectionStatus::Errored);
                return;
            }
        }
    } else if net.lock().expect("net poisoned").port_number.is_none() {
        // root node with no preset port: claim the default and release the
        // receiver to bind it
        let default = net.lock().expect("net poisoned").default_broker_port();
        let mut setports = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
        setports.extra_data = i32::from(default);
        let _ = control_to_rx.send(setports);
    }

    state.set_tx_status(ConnectionStatus::Connected);
    let mut routes: HashMap<RouteId, TcpFrame> = HashMap::new();

    while let Some((route, cmd)) = tx_queue.pop().await {
        if !process_tx_command(
            &state, &net, &control_to_rx, &mut broker_frame, &mut routes, route, cmd,
        )
        .await
        {
            break;
        }
    }

    if state.rx_status() == ConnectionStatus::Connected {
        let _ = control_to_rx.send(ActionMessage::protocol(protocol::CLOSE_RECEIVER));
    }
    state.set_tx_status(ConnectionStatus::Terminated);
}

/// Handle one queued transmit item; false ends the transmit loop.
async fn process_tx_command(
    state: &CommsState,
    net: &SharedNet,
    control_to_rx: &mpsc::UnboundedSender<ActionMessage>,
    broker_frame: &mut Option<TcpFrame>,
    routes: &mut HashMap<RouteId, TcpFrame>,
    route: RouteId,
    cmd: ActionMessage,
) -> bool {
    if cmd.is_protocol_command() && route == RouteId::CONTROL {
        match cmd.message_id {
            protocol::RECONNECT_TRANSMITTER => {
                state.set_tx_status(ConnectionStatus::Connected);
                return true;
            }
            protocol::NEW_BROKER_INFORMATION => {
                let target = cmd.payload.to_str().unwrap_or("").to_string();
                match extract_interface_and_port(&target) {
                    Some((host, port)) => {
                        let address = make_port_address(host, port);
                        match TcpStream::connect(&address).await {
                            Ok(stream) => {
                                *broker_frame = Some(Framed::new(stream, ActionCodec::new()));
                                net.lock().expect("net poisoned").set_broker_port(port);
                            }
                            Err(err) => {
                                tracing::error!(%address, "unable to reach new broker: {err}");
                            }
                        }
                    }
                    None => tracing::error!(%target, "unusable new broker address"),
                }
                return true;
            }
            protocol::NEW_ROUTE => {
                let target = cmd.payload.to_str().unwrap_or("").to_string();
                match TcpStream::connect(&target).await {
                    Ok(stream) => {
                        routes.insert(
                            RouteId(cmd.extra_data),
                            Framed::new(stream, ActionCodec::new()),
                        );
                    }
                    Err(err) => {
                        tracing::error!(%target, "unable to connect route: {err}");
                    }
                }
                return true;
            }
            protocol::REMOVE_ROUTE => {
                routes.remove(&RouteId(cmd.extra_data));
                return true;
            }
            protocol::DISCONNECT => {
                return false;
            }
            _ => {}
        }
    }

    if route == RouteId::PARENT {
        match broker_frame.as_mut() {
            Some(frame) => {
                if let Err(err) = frame.send(cmd).await {
                    tracing::error!("transmit to broker failed: {err}");
                }
            }
            None => tracing::warn!("no route to broker for message"),
        }
    } else if route == RouteId::CONTROL {
        let _ = control_to_rx.send(cmd);
    } else if let Some(frame) = routes.get_mut(&route) {
        if let Err(err) = frame.send(cmd).await {
            tracing::error!(%route, "transmit on route failed: {err}");
        }
    } else if let Some(frame) = broker_frame.as_mut() {
        if let Err(err) = frame.send(cmd).await {
            tracing::error!("transmit to broker failed: {err}");
        }
    } else if !cmd.is_ignoreable_command() {
        tracing::warn!("unknown route and no broker, dropping message {cmd}");
    }
    true
}

async fn run_receiver(
    state: Arc<CommsState>,
    net: SharedNet,
    mut control_rx: mpsc::UnboundedReceiver<ActionMessage>,
) {
    let config = state.config();

    // wait for a port assignment before binding
    while net.lock().expect("net poisoned").port_number.is_none() {
        match control_rx.recv().await {
            Some(msg) if msg.is_protocol_command() => match msg.message_id {
                protocol::PORT_DEFINITIONS => {
                    net.lock().expect("net poisoned").load_port_definitions(&msg);
                }
                protocol::NAME_NOT_FOUND => {
                    tracing::error!(
                        broker = %config.broker_name,
                        "broker name does not match broker connection"
                    );
                    state.set_rx_status(ConnectionStatus::Errored);
                    return;
                }
                protocol::DISCONNECT | protocol::CLOSE_RECEIVER => {
                    state.set_rx_status(ConnectionStatus::Terminated);
                    return;
                }
                protocol::DISCONNECT_ERROR => {
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

    let listener = match bind_listener(&net, &config).await {
        Some(listener) => listener,
        None => {
            state.set_rx_status(ConnectionStatus::Errored);
            return;
        }
    };
    state.set_rx_status(ConnectionStatus::Connected);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(?peer, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            state.clone(),
                            net.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(err) => {
                        tracing::error!("accept failed: {err}");
                    }
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
    let _ = shutdown_tx.send(true);
    state.set_rx_status(ConnectionStatus::Terminated);
}

/// Bind the listening socket, falling back per the auto-port and
/// force-connection policies.
async fn bind_listener(net: &SharedNet, config: &CommsConfig) -> Option<TcpListener> {
    let host = {
        let local = strip_protocol(&config.local_target);
        if local.is_empty() || local == "*" || local == "localhost" {
            "0.0.0.0".to_string()
        } else {
            local.to_string()
        }
    };
    let mut forced = false;
    loop {
        let (port, auto_port) = {
            let net = net.lock().expect("net poisoned");
            (net.port_number.expect("port assigned before bind"), net.auto_port_number)
        };
        match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => return Some(listener),
            Err(err) => {
                if auto_port && !config.server_mode {
                    // the broker assigned this automatically; try the next one
                    net.lock().expect("net poisoned").port_number = Some(port + 1);
                    continue;
                }
                let force = net.lock().expect("net poisoned").force_connection;
                if force && !forced {
                    forced = true;
                    tracing::warn!(
                        port,
                        "attempting to override existing occupant and force the connection"
                    );
                    force_terminate_occupant(&host, port, config).await;
                    continue;
                }
                tracing::error!(port, "unable to bind receiver: {err}");
                return None;
            }
        }
    }
}

/// Ask whatever currently holds the port to shut down, then linger long
/// enough for the socket to actually close.
async fn force_terminate_occupant(host: &str, port: u16, config: &CommsConfig) {
    let address = make_port_address(host, port);
    if let Ok(Ok(stream)) = timeout(config.connection_timeout, TcpStream::connect(&address)).await
    {
        let mut frame = Framed::new(stream, ActionCodec::new());
        let mut term = ActionMessage::new(Action::GlobalError);
        term.message_id = protocol::DISCONNECT_ERROR;
        term.payload = "force termination for new broker".into();
        let _ = frame.send(term).await;
        let _ = frame.close().await;
    }
    tokio::time::sleep(config.force_linger).await;
}

/// Per-connection read loop on the server side.
async fn handle_connection(
    stream: TcpStream,
    state: Arc<CommsState>,
    net: SharedNet,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framed = Framed::new(stream, ActionCodec::new());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = framed.next() => {
                match msg {
                    Some(Ok(cmd)) => {
                        if cmd.is_protocol_command() {
                            let reply = net
                                .lock()
                                .expect("net poisoned")
                                .generate_reply_to_incoming_message(&cmd);
                            if reply.action != Action::Ignore {
                                if let Err(err) = framed.send(reply).await {
                                    tracing::error!("protocol reply failed: {err}");
                                    break;
                                }
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
                    Some(Err(err)) => {
                        tracing::error!("connection decode error: {err}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
