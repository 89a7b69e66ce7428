//! Bootstrap servers on the well-known ports.
//!
//! A broker server answers port-request protocol messages so new cores and
//! sub-brokers can find a federation without preconfigured ports. Each
//! server hands out candidate ports from a fixed block just past its
//! well-known port.

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::codec::Framed;

use metronome_core::command::{protocol, Action, ActionMessage};

use crate::{
    codec::ActionCodec,
    defaults::{
        BROKER_SERVER_PORT_COUNT, BROKER_SERVER_PORT_OFFSET, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT,
    },
    CommsError,
};

/// Candidate ports a server may assign to joining peers.
#[derive(Debug)]
struct PortData {
    candidates: Vec<u16>,
    next: usize,
}

impl PortData {
    fn new(base_port: u16) -> Self {
        let start = base_port + BROKER_SERVER_PORT_OFFSET;
        PortData {
            candidates: (start..start + BROKER_SERVER_PORT_COUNT).collect(),
            next: 0,
        }
    }

    fn assign(&mut self) -> Option<u16> {
        let port = self.candidates.get(self.next).copied();
        if port.is_some() {
            self.next += 1;
        }
        port
    }
}

#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    pub name: String,
    pub port: u16,
}

impl BrokerServerConfig {
    pub fn tcp(name: &str) -> Self {
        BrokerServerConfig { name: name.to_string(), port: DEFAULT_TCP_PORT }
    }

    pub fn udp(name: &str) -> Self {
        BrokerServerConfig { name: name.to_string(), port: DEFAULT_UDP_PORT }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Shared request handling for every server flavor. `None` means ignore.
fn generate_message_response(
    cmd: &ActionMessage,
    ports: &mut PortData,
    server_port: u16,
) -> Option<ActionMessage> {
    if !cmd.is_protocol_command() {
        return None;
    }
    match cmd.message_id {
        protocol::REQUEST_PORTS => {
            let mut reply = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
            match ports.assign() {
                Some(port) => {
                    reply.extra_data = i32::from(port);
                    reply.counter = cmd.counter;
                    reply.source_id = metronome_core::GlobalFederateId(i32::from(server_port));
                    Some(reply)
                }
                None => {
                    let mut delay = ActionMessage::protocol(protocol::DELAY_CONNECTION);
                    delay.payload = "no ports available".into();
                    Some(delay)
                }
            }
        }
        protocol::QUERY_PORTS => {
            let mut reply = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
            reply.extra_data = i32::from(server_port);
            Some(reply)
        }
        protocol::CONNECTION_REQUEST => Some(ActionMessage::protocol(protocol::CONNECTION_ACK)),
        _ => None,
    }
}

/// Whether a raw payload is the textual shutdown request for `name`.
fn is_close_request(data: &[u8], name: &str) -> bool {
    data.strip_prefix(b"close_server:")
        .map(|rest| rest == name.as_bytes())
        .unwrap_or(false)
}

pub struct BrokerServerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    pub port: u16,
}

impl BrokerServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// TCP flavor: framed request/reply per connection.
pub async fn start_tcp_server(config: BrokerServerConfig) -> Result<BrokerServerHandle, CommsError> {
    let listener =
        TcpListener::bind(("0.0.0.0", config.port)).await.map_err(|source| CommsError::Bind {
            address: format!("0.0.0.0:{}", config.port),
            source,
        })?;
    let port = listener.local_addr()?.port();
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    tracing::info!(name = %config.name, port, "tcp broker server listening");

    let handle = tokio::spawn(async move {
        let mut ports = PortData::new(port);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let mut framed = Framed::new(stream, ActionCodec::new());
                    while let Some(Ok(cmd)) = framed.next().await {
                        if is_close_request(cmd.payload.as_bytes(), &config.name) {
                            return;
                        }
                        if let Some(reply) = generate_message_response(&cmd, &mut ports, port) {
                            if framed.send(reply).await.is_err() {
                                break;
                            }
                        } else if !matches!(cmd.action, Action::Ignore) {
                            tracing::warn!("broker server ignoring {cmd}");
                        }
                    }
                }
            }
        }
    });
    Ok(BrokerServerHandle { shutdown, handle, port })
}

/// UDP flavor: datagram request/reply with a fixed receive buffer.
pub async fn start_udp_server(config: BrokerServerConfig) -> Result<BrokerServerHandle, CommsError> {
    let socket =
        UdpSocket::bind(("0.0.0.0", config.port)).await.map_err(|source| CommsError::Bind {
            address: format!("0.0.0.0:{}", config.port),
            source,
        })?;
    let port = socket.local_addr()?.port();
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    tracing::info!(name = %config.name, port, "udp broker server listening");

    let handle = tokio::spawn(async move {
        let mut ports = PortData::new(port);
        let mut buffer = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buffer) => {
                    let Ok((len, from)) = received else { continue };
                    if is_close_request(&buffer[..len], &config.name) {
                        break;
                    }
                    let Ok(cmd) = ActionMessage::from_bytes(&buffer[..len]) else {
                        continue;
                    };
                    if let Some(reply) = generate_message_response(&cmd, &mut ports, port) {
                        let _ = socket.send_to(&reply.to_bytes(), from).await;
                    }
                }
            }
        }
    });
    Ok(BrokerServerHandle { shutdown, handle, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn tcp_server_assigns_distinct_ports() {
        let server = start_tcp_server(BrokerServerConfig::tcp("testsrv").with_port(0))
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", server.port);

        let mut assigned = Vec::new();
        for _ in 0..3 {
            let stream = TcpStream::connect(&addr).await.unwrap();
            let mut framed = Framed::new(stream, ActionCodec::new());
            framed
                .send(ActionMessage::protocol(protocol::REQUEST_PORTS))
                .await
                .unwrap();
            let reply = framed.next().await.unwrap().unwrap();
            assert_eq!(reply.message_id, protocol::PORT_DEFINITIONS);
            assigned.push(reply.extra_data);
        }
        assert!(assigned.windows(2).all(|w| w[0] < w[1]));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn udp_server_replies_and_closes() {
        let server = start_udp_server(BrokerServerConfig::udp("udpsrv").with_port(0))
            .await
            .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", server.port);

        client
            .send_to(&ActionMessage::protocol(protocol::QUERY_PORTS).to_bytes(), &addr)
            .await
            .unwrap();
        let mut buffer = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        let reply = ActionMessage::from_bytes(&buffer[..len]).unwrap();
        assert_eq!(reply.message_id, protocol::PORT_DEFINITIONS);
        assert_eq!(reply.extra_data, i32::from(server.port));

        client.send_to(b"close_server:udpsrv", &addr).await.unwrap();
        server.shutdown().await;
    }
}
