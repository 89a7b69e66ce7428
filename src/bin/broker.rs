//! Stand-alone federation broker.

use clap::Parser;

use metronome::runner::{BrokerArgs, TransportKind};
use metronome_comms::{
    broker_server::{self, BrokerServerConfig},
    defaults::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT},
    inproc::InprocComms,
    tcp::TcpComms,
    tcp_ss::TcpCommsSs,
    udp::UdpComms,
    CommsBroker, CommsDriver, KernelRole,
};
use metronome_core::{
    command::{Action, ActionMessage},
    RouteId,
};
use metronome_kernel::{Broker, BrokerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = BrokerArgs::parse();
    let broker = Broker::new(BrokerConfig::root(&args.name, args.federates));

    match args.transport {
        TransportKind::Tcp => {
            let port = args.local_port.unwrap_or(DEFAULT_TCP_PORT);
            let mut driver = TcpComms::new().with_local_port(port);
            driver.net.force_connection = args.force_connection;
            driver.net.use_json_serialization = args.use_json_serialization;
            driver.net.max_retries = args.max_retries;
            run(args, broker, driver, port).await
        }
        TransportKind::Udp => {
            let port = args.local_port.unwrap_or(DEFAULT_UDP_PORT);
            let mut driver = UdpComms::new().with_local_port(port);
            driver.net.use_json_serialization = args.use_json_serialization;
            driver.net.max_retries = args.max_retries;
            run(args, broker, driver, port).await
        }
        TransportKind::TcpSs => {
            let port = args.local_port.unwrap_or_else(|| {
                metronome_comms::defaults::DEFAULT_TCP_SS_PORT
            });
            let mut driver = TcpCommsSs::new().with_local_port(port);
            driver.connections = args.connections.clone();
            if args.no_outgoing_connection {
                driver = driver.accept_only();
            }
            run(args, broker, driver, port).await
        }
        TransportKind::Inproc => {
            let driver = InprocComms::default();
            run(args, broker, driver, 0).await
        }
    }
}

async fn run<D: CommsDriver>(
    args: BrokerArgs,
    broker: Broker,
    driver: D,
    port: u16,
) -> anyhow::Result<()> {
    let mut broker = broker;
    let mut comms = CommsBroker::new(driver, broker.role());
    comms.comms().set_name(&args.name);
    comms.comms().modify_config(|config| {
        config.local_target = args.interface.clone();
        config.server_mode = true;
    });
    {
        let transmit = comms.comms().handle();
        let routes = transmit.clone();
        broker
            .attach_comms(
                move |route: RouteId, cmd| transmit.transmit(route, cmd),
                move |route: RouteId, info: String| routes.add_route(route, &info),
            )
            .await?;
    }
    if !comms.connect().await {
        anyhow::bail!("broker failed to open its {:?} interface", args.transport);
    }
    tracing::info!(name = %args.name, port, "broker up");

    let server = if args.server && matches!(args.transport, TransportKind::Tcp) {
        Some(broker_server::start_tcp_server(BrokerServerConfig::tcp(&args.name)).await?)
    } else if args.server && matches!(args.transport, TransportKind::Udp) {
        Some(broker_server::start_udp_server(BrokerServerConfig::udp(&args.name)).await?)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::warn!("interrupt received, aborting federation");

    // propagate the abort before tearing the sockets down
    let mut abort = ActionMessage::new(Action::GlobalError);
    abort.message_id = 1;
    abort.payload = "user abort".into();
    broker.role().queue_command(abort);
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if let Some(server) = server {
        server.shutdown().await;
    }
    comms.disconnect().await;
    broker.shutdown().await;
    Ok(())
}
