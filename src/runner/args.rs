//! Command-line argument groups for the runtime binaries.

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Tcp,
    TcpSs,
    Udp,
    Inproc,
}

/// Arguments for a stand-alone broker. Long flags accept both hyphen and
/// underscore spellings.
#[derive(Debug, Parser)]
#[command(name = "metronome-broker", about = "Federation routing hub")]
pub struct BrokerArgs {
    /// Broker name within the federation.
    #[arg(long, default_value = "broker")]
    pub name: String,

    /// Transport used to reach this broker.
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: TransportKind,

    /// Interface to bind on.
    #[arg(long, default_value = "0.0.0.0")]
    pub interface: String,

    /// Port to listen on; transport default when omitted.
    #[arg(long, visible_alias = "local_port")]
    pub local_port: Option<u16>,

    /// Address of a parent broker, making this a sub-broker.
    #[arg(long, visible_alias = "broker_address")]
    pub broker_address: Option<String>,

    /// Port of the parent broker.
    #[arg(long, visible_alias = "broker_port")]
    pub broker_port: Option<u16>,

    /// Number of federates the init barrier waits for.
    #[arg(long, default_value_t = 1)]
    pub federates: usize,

    /// Also run the well-known-port bootstrap server.
    #[arg(long)]
    pub server: bool,

    /// Connection retry limit.
    #[arg(long, visible_alias = "max_retries", default_value_t = 5)]
    pub max_retries: u32,

    /// Single-socket mode: refuse outgoing connections.
    #[arg(long, visible_alias = "no_outgoing_connection")]
    pub no_outgoing_connection: bool,

    /// Single-socket mode: peer addresses to dial eagerly.
    #[arg(long)]
    pub connections: Vec<String>,

    /// Force-supersede an existing occupant of the port.
    #[arg(long, visible_alias = "force_connection")]
    pub force_connection: bool,

    /// Use the JSON wire form on all links.
    #[arg(long, visible_alias = "use_json_serialization")]
    pub use_json_serialization: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_and_hyphen_flags_parse() {
        let args = BrokerArgs::parse_from([
            "metronome-broker",
            "--name",
            "b0",
            "--local_port",
            "25000",
            "--max-retries",
            "3",
            "--federates",
            "4",
        ]);
        assert_eq!(args.name, "b0");
        assert_eq!(args.local_port, Some(25000));
        assert_eq!(args.max_retries, 3);
        assert_eq!(args.federates, 4);
    }
}
