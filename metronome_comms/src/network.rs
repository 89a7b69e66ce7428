//! Network-transport shared logic: port negotiation, reply generation for
//! the bootstrap protocol, and address advertisement.

use metronome_core::{
    command::{protocol, Action, ActionMessage},
    GlobalFederateId,
};

use crate::{allocator::PortAllocator, defaults::DEFAULT_PORT_REQUEST_COUNT, interface::CommsConfig};

/// Strip a `proto://` prefix from an address string.
pub fn strip_protocol(address: &str) -> &str {
    match address.find("://") {
        Some(pos) => &address[pos + 3..],
        None => address,
    }
}

/// Combine a host and port into a dialable address.
pub fn make_port_address(host: &str, port: u16) -> String {
    format!("{}:{}", strip_protocol(host), port)
}

/// Split `host:port`; a host of `?` means "keep the current host".
pub fn extract_interface_and_port(address: &str) -> Option<(&str, u16)> {
    let address = strip_protocol(address);
    let (host, port) = address.rsplit_once(':')?;
    port.parse().ok().map(|port| (host, port))
}

/// Whether an address is a wildcard bind target.
fn is_wildcard(address: &str) -> bool {
    matches!(strip_protocol(address), "*" | "0.0.0.0" | "::" | "")
}

/// Keep derived allocator seeds inside the dynamic port range.
fn clamp_port(port: u32) -> u16 {
    port.min(u32::from(u16::MAX) - 1024) as u16
}

/// Port-negotiation state shared by the network transports.
#[derive(Debug)]
pub struct NetworkCommsData {
    pub broker_port: Option<u16>,
    pub port_number: Option<u16>,
    /// The local port was assigned automatically and may be incremented on
    /// a bind collision.
    pub auto_port_number: bool,
    pub max_retries: u32,
    pub open_ports: PortAllocator,
    pub append_name_to_address: bool,
    pub noack_connection: bool,
    pub use_json_serialization: bool,
    pub force_connection: bool,
    /// Passed through to the transport; no cryptographic duty here.
    pub encrypted: bool,
    default_broker_port: u16,
}

impl NetworkCommsData {
    pub fn new(default_broker_port: u16) -> Self {
        NetworkCommsData {
            broker_port: None,
            port_number: None,
            auto_port_number: true,
            max_retries: 5,
            open_ports: PortAllocator::new(),
            append_name_to_address: false,
            noack_connection: false,
            use_json_serialization: false,
            force_connection: false,
            encrypted: false,
            default_broker_port,
        }
    }

    pub fn default_broker_port(&self) -> u16 {
        self.default_broker_port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port_number = Some(port);
        self.auto_port_number = false;
    }

    pub fn set_broker_port(&mut self, port: u16) {
        self.broker_port = Some(port);
    }

    pub fn broker_port_or_default(&self) -> u16 {
        self.broker_port.unwrap_or(self.default_broker_port)
    }

    /// Allocate `count` ports for a joining peer on `host`, seeding the
    /// allocator cursor relative to this comm's own port block on first use.
    pub fn find_open_port(&mut self, count: u16, host: &str) -> u16 {
        if self.open_ports.starting_port().is_none() {
            let own = u32::from(self.port_number.unwrap_or(self.default_broker_port));
            let base = u32::from(self.default_broker_port);
            let count = u32::from(count);
            let dport = own.saturating_sub(base);
            let start = if dport < 10 * count {
                base + 10 * count * (dport + 1)
            } else {
                own + 5 * count
            };
            self.open_ports.set_starting_port(clamp_port(start));
        }
        self.open_ports.find_open_port(count, host, self.default_broker_port + 100)
    }

    /// Server-side handling of bootstrap protocol commands. Anything not
    /// recognized gets `Ignore` back and the caller forwards the original.
    pub fn generate_reply_to_incoming_message(&mut self, cmd: &ActionMessage) -> ActionMessage {
        if cmd.is_protocol_command() {
            match cmd.message_id {
                protocol::QUERY_PORTS => {
                    let mut reply = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
                    reply.extra_data = i32::from(self.port_number.unwrap_or(0));
                    return reply;
                }
                protocol::REQUEST_PORTS => {
                    let count = if cmd.counter == 0 {
                        DEFAULT_PORT_REQUEST_COUNT
                    } else {
                        cmd.counter
                    };
                    let host =
                        if cmd.name.is_empty() { "localhost" } else { cmd.name.as_str() };
                    let open_port = self.find_open_port(count, host);
                    let mut reply = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
                    // the source id carries our own port for back-reference
                    reply.source_id =
                        GlobalFederateId(i32::from(self.port_number.unwrap_or(0)));
                    reply.extra_data = i32::from(open_port);
                    reply.counter = cmd.counter;
                    return reply;
                }
                protocol::CONNECTION_REQUEST => {
                    return ActionMessage::protocol(protocol::CONNECTION_ACK);
                }
                _ => {}
            }
        }
        ActionMessage::new(Action::Ignore)
    }

    /// The REQUEST_PORTS message a client sends its broker.
    pub fn generate_port_request(&self, config: &CommsConfig, count: u16) -> ActionMessage {
        let mut req = ActionMessage::protocol(protocol::REQUEST_PORTS);
        req.payload = strip_protocol(&config.local_target).into();
        req.counter = count;
        req.string_data =
            vec![config.broker_name.clone(), config.broker_init_string.clone()];
        req
    }

    /// Absorb a PORT_DEFINITIONS reply, deriving an allocator seed from the
    /// assigned port so child allocations land in a disjoint block.
    pub fn load_port_definitions(&mut self, cmd: &ActionMessage) {
        if cmd.is_protocol_command() && cmd.message_id == protocol::PORT_DEFINITIONS {
            let port = cmd.extra_data.clamp(0, i32::from(u16::MAX)) as u16;
            self.port_number = Some(port);
            if self.open_ports.starting_port().is_none() {
                let base = u32::from(self.default_broker_port);
                let port = u32::from(port);
                let start = if port < base + 100 {
                    base + 100 + port.saturating_sub(base + 2) * 6
                } else {
                    base + 110 + (port - base - 100) * 6
                };
                self.open_ports.set_starting_port(clamp_port(start));
            }
        }
    }

    /// The address this comm advertises for inbound routes. Wildcard bind
    /// addresses are rewritten to the loopback form peers can dial.
    pub fn get_address(&self, config: &CommsConfig) -> String {
        let port = match self.port_number {
            Some(port) => port,
            None if !config.server_mode => return config.name.clone(),
            None => 0,
        };
        let local = strip_protocol(&config.local_target);
        let mut address = if is_wildcard(local) {
            make_port_address("127.0.0.1", port)
        } else {
            make_port_address(local, port)
        };
        if self.append_name_to_address {
            address.push('/');
            address.push_str(&config.name);
        }
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(strip_protocol("tcp://1.2.3.4"), "1.2.3.4");
        assert_eq!(extract_interface_and_port("10.0.0.1:9000"), Some(("10.0.0.1", 9000)));
        assert_eq!(extract_interface_and_port("tcp://10.0.0.1:9000"), Some(("10.0.0.1", 9000)));
        assert_eq!(extract_interface_and_port("noport"), None);
        assert_eq!(extract_interface_and_port("?:8080"), Some(("?", 8080)));
    }

    #[test]
    fn wildcard_addresses_are_advertised_as_loopback() {
        let mut net = NetworkCommsData::new(24160);
        net.set_port(24162);
        let mut config = CommsConfig { local_target: "*".into(), ..Default::default() };
        config.server_mode = true;
        assert_eq!(net.get_address(&config), "127.0.0.1:24162");

        config.local_target = "tcp://0.0.0.0".into();
        assert_eq!(net.get_address(&config), "127.0.0.1:24162");

        net.append_name_to_address = true;
        config.name = "core0".into();
        assert_eq!(net.get_address(&config), "127.0.0.1:24162/core0");
    }

    #[test]
    fn request_ports_reply_allocates_and_echoes() {
        let mut net = NetworkCommsData::new(24160);
        net.set_port(24160);

        let mut req = ActionMessage::protocol(protocol::REQUEST_PORTS);
        req.counter = 2;
        let reply = net.generate_reply_to_incoming_message(&req);
        assert_eq!(reply.message_id, protocol::PORT_DEFINITIONS);
        assert_eq!(reply.counter, 2);
        assert_eq!(reply.source_id.0, 24160);
        let first = reply.extra_data;

        let reply2 = net.generate_reply_to_incoming_message(&req);
        assert!(reply2.extra_data > first, "successive allocations advance");
    }

    #[test]
    fn unknown_protocol_commands_get_ignore() {
        let mut net = NetworkCommsData::new(24160);
        let cmd = ActionMessage::protocol(protocol::NEW_BROKER_INFORMATION);
        assert_eq!(net.generate_reply_to_incoming_message(&cmd).action, Action::Ignore);
        let data = ActionMessage::new(Action::Publish);
        assert_eq!(net.generate_reply_to_incoming_message(&data).action, Action::Ignore);
    }

    #[test]
    fn port_definitions_update_local_state() {
        let mut net = NetworkCommsData::new(24160);
        let mut reply = ActionMessage::protocol(protocol::PORT_DEFINITIONS);
        reply.extra_data = 24170;
        net.load_port_definitions(&reply);
        assert_eq!(net.port_number, Some(24170));
        assert!(net.open_ports.starting_port().is_some());
    }
}
