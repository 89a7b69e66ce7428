//! TCP single-socket transport: one persistent stream per peer pair.
//!
//! Clients keep exactly one connection to the server and identify
//! themselves with a CONNECTION_INFORMATION handshake; the server maps peer
//! names to live connections and routes by name. A server can be configured
//! to accept only (no outgoing connections).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
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
    defaults::DEFAULT_TCP_SS_PORT,
    interface::{CommsDriver, CommsState, ConnectionStatus, DriverContext, TxQueue},
    network::{make_port_address, strip_protocol, NetworkCommsData},
};

type Writers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ActionMessage>>>>;

pub struct TcpCommsSs {
    pub net: NetworkCommsData,
    /// Accept-only server: never dial out.
    pub no_outgoing_connections: bool,
    /// Peer addresses to dial eagerly at startup.
    pub connections: Vec<String>,
}

impl Default for TcpCommsSs {
    fn default() -> Self {
        TcpCommsSs::new()
    }
}

impl TcpCommsSs {
    pub fn new() -> Self {
        TcpCommsSs {
            net: NetworkCommsData::new(DEFAULT_TCP_SS_PORT),
            no_outgoing_connections: false,
            connections: Vec::new(),
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.net.set_port(port);
        self
    }

    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.net.set_broker_port(port);
        self
    }

    pub fn accept_only(mut self) -> Self {
        self.no_outgoing_connections = true;
        self
    }
}

impl CommsDriver for TcpCommsSs {
    fn start(self, ctx: DriverContext) -> (JoinHandle<()>, Option<JoinHandle<()>>) {
        let DriverContext { state, tx_queue, control_to_rx, control_rx } = ctx;
        let config = state.config();
        if config.server_mode {
            let net = Arc::new(Mutex::new(self.net));
            let writers: Writers = Arc::default();
            let eager = if self.no_outgoing_connections { Vec::new() } else { self.connections };
            let rx_handle = tokio::spawn(run_server_receiver(
                state.clone(),
                net.clone(),
                writers.clone(),
                eager,
                control_rx,
            ));
            let tx_handle =
                tokio::spawn(run_server_transmitter(state, writers, tx_queue, control_to_rx));
            (tx_handle, Some(rx_handle))
        } else {
            // single socket, single task: both duties share the connection
            let handle = tokio::spawn(run_client(self, state, tx_queue, control_rx));
            (handle, None)
        }
    }
}

async fn run_server_receiver(
    state: Arc<CommsState>,
    net: Arc<Mutex<NetworkCommsData>>,
    writers: Writers,
    eager_connections: Vec<String>,
    mut control_rx: mpsc::UnboundedReceiver<ActionMessage>,
) {
    let config = state.config();
    let port = {
        let net = net.lock().expect("net poisoned");
        net.port_number.unwrap_or_else(|| net.default_broker_port())
    };
    let host = {
        let local = strip_protocol(&config.local_target);
        if local.is_empty() || local == "*" || local == "localhost" {
            "0.0.0.0".to_string()
        } else {
            local.to_string()
        }
    };
    let listener = match TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, "unable to bind single-socket server: {err}");
            state.set_rx_status(ConnectionStatus::Errored);
            return;
        }
    };
    state.set_rx_status(ConnectionStatus::Connected);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // dial configured peers eagerly, announcing ourselves on each
    for address in eager_connections {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                tokio::spawn(handle_server_connection(
                    stream,
                    state.clone(),
                    net.clone(),
                    writers.clone(),
                    Some(config.name.clone()),
                    shutdown_rx.clone(),
                ));
            }
            Err(err) => {
                tracing::error!(%address, "unable to reach configured peer: {err}");
            }
        }
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(?peer, "accepted single-socket connection");
                        tokio::spawn(handle_server_connection(
                            stream,
                            state.clone(),
                            net.clone(),
                            writers.clone(),
                            None,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(err) => tracing::error!("accept failed: {err}"),
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

/// One connected client: read side registers the peer name on handshake and
/// feeds the kernel; a paired writer task drains the outbound channel.
async fn handle_server_connection(
    stream: TcpStream,
    state: Arc<CommsState>,
    net: Arc<Mutex<NetworkCommsData>>,
    writers: Writers,
    announce: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let framed = Framed::new(stream, ActionCodec::new());
    let (mut sink, mut read) = framed.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ActionMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Some(own_name) = announce {
        let mut info = ActionMessage::protocol_priority(protocol::CONNECTION_INFORMATION);
        info.name = own_name;
        let _ = writer_tx.send(info);
    }

    let mut peer_name: Option<String> = None;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(cmd)) => {
                        if cmd.is_protocol_command() {
                            match cmd.message_id {
                                protocol::CONNECTION_INFORMATION => {
                                    let name = cmd.name.clone();
                                    writers
                                        .lock()
                                        .expect("writer registry poisoned")
                                        .insert(name.clone(), writer_tx.clone());
                                    peer_name = Some(name);
                                    let noack = net
                                        .lock()
                                        .expect("net poisoned")
                                        .noack_connection;
                                    if !noack {
                                        let _ = writer_tx.send(ActionMessage::protocol(
                                            protocol::CONNECTION_ACK,
                                        ));
                                    }
                                }
                                protocol::CLOSE_RECEIVER | protocol::DISCONNECT => break,
                                _ => {
                                    let reply = net
                                        .lock()
                                        .expect("net poisoned")
                                        .generate_reply_to_incoming_message(&cmd);
                                    if reply.action != Action::Ignore {
                                        let _ = writer_tx.send(reply);
                                    } else {
                                        state.deliver(cmd);
                                    }
                                }
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
    if let Some(name) = peer_name {
        writers.lock().expect("writer registry poisoned").remove(&name);
    }
    drop(writer_tx);
    let _ = writer.await;
}

async fn run_server_transmitter(
    state: Arc<CommsState>,
    writers: Writers,
    mut tx_queue: TxQueue,
    control_to_rx: mpsc::UnboundedSender<ActionMessage>,
) {
    state.set_tx_status(ConnectionStatus::Connected);
    // routes resolve to peer names; the live connection is looked up per
    // send so a route can outlive a reconnect
    let mut routes: HashMap<RouteId, String> = HashMap::new();

    while let Some((route, cmd)) = tx_queue.pop().await {
        if cmd.is_protocol_command() && route == RouteId::CONTROL {
            match cmd.message_id {
                protocol::RECONNECT_TRANSMITTER => {
                    state.set_tx_status(ConnectionStatus::Connected);
                    continue;
                }
                protocol::NEW_ROUTE => {
                    let name = cmd.payload.to_str().unwrap_or("").to_string();
                    routes.insert(RouteId(cmd.extra_data), name);
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
        let target = routes.get(&route);
        let sender = target.and_then(|name| {
            writers.lock().expect("writer registry poisoned").get(name).cloned()
        });
        match sender {
            Some(sender) => {
                let _ = sender.send(cmd);
            }
            None => {
                if !cmd.is_ignoreable_command() {
                    tracing::warn!(
                        %route,
                        peer = target.map(String::as_str).unwrap_or("<unset>"),
                        "no live connection for route, dropping message"
                    );
                }
            }
        }
    }

    if state.rx_status() == ConnectionStatus::Connected {
        let _ = control_to_rx.send(ActionMessage::protocol(protocol::CLOSE_RECEIVER));
    }
    state.set_tx_status(ConnectionStatus::Terminated);
}

/// Client side: dial the server, identify, then multiplex both duties over
/// the single connection.
async fn run_client(
    comms: TcpCommsSs,
    state: Arc<CommsState>,
    mut tx_queue: TxQueue,
    mut control_rx: mpsc::UnboundedReceiver<ActionMessage>,
) {
    let config = state.config();
    let broker_port = comms.net.broker_port_or_default();
    let address = make_port_address(strip_protocol(&config.broker_target), broker_port);

    let stream = match timeout(config.connection_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            tracing::error!(%address, "unable to reach single-socket server");
            state.set_tx_status(ConnectionStatus::Errored);
            state.set_rx_status(ConnectionStatus::Errored);
            return;
        }
    };
    let mut framed = Framed::new(stream, ActionCodec::new());

    let mut info = ActionMessage::protocol_priority(protocol::CONNECTION_INFORMATION);
    info.name = config.name.clone();
    info.string_data = vec![config.broker_name.clone(), config.broker_init_string.clone()];
    info.payload = config.name.as_str().into();
    if framed.send(info).await.is_err() {
        state.set_tx_status(ConnectionStatus::Errored);
        state.set_rx_status(ConnectionStatus::Errored);
        return;
    }
    if !comms.net.noack_connection {
        match timeout(config.connection_timeout, framed.next()).await {
            Ok(Some(Ok(reply)))
                if reply.is_protocol_command()
                    && reply.message_id == protocol::CONNECTION_ACK => {}
            other => {
                tracing::error!(?address, "handshake failed: {other:?}");
                state.set_tx_status(ConnectionStatus::Errored);
                state.set_rx_status(ConnectionStatus::Errored);
                return;
            }
        }
    }
    state.set_tx_status(ConnectionStatus::Connected);
    state.set_rx_status(ConnectionStatus::Connected);

    // send and receive halves separate so both duties can share the loop
    let (mut sink, mut inbound_stream) = framed.split();
    loop {
        tokio::select! {
            item = tx_queue.pop() => {
                let Some((route, cmd)) = item else { break };
                if cmd.is_protocol_command() && route == RouteId::CONTROL {
                    match cmd.message_id {
                        protocol::DISCONNECT | protocol::CLOSE_RECEIVER => break,
                        // single socket: routes collapse onto the one connection
                        protocol::NEW_ROUTE | protocol::REMOVE_ROUTE => continue,
                        _ => continue,
                    }
                }
                if route == RouteId::CONTROL {
                    continue;
                }
                if sink.send(cmd).await.is_err() {
                    tracing::error!("single-socket transmit failed");
                    break;
                }
            }
            inbound = inbound_stream.next() => {
                match inbound {
                    Some(Ok(cmd)) => {
                        if cmd.is_protocol_command() {
                            match cmd.message_id {
                                protocol::CLOSE_RECEIVER | protocol::DISCONNECT => break,
                                _ => state.deliver(cmd),
                            }
                        } else {
                            state.deliver(cmd);
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!("single-socket decode error: {err}");
                        break;
                    }
                    None => break,
                }
            }
            ctl = control_rx.recv() => {
                match ctl {
                    Some(cmd) if cmd.is_protocol_command()
                        && matches!(
                            cmd.message_id,
                            protocol::CLOSE_RECEIVER | protocol::DISCONNECT
                        ) => break,
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
    state.set_tx_status(ConnectionStatus::Terminated);
    state.set_rx_status(ConnectionStatus::Terminated);
}
