//! Builders that wire a broker and a set of cores over a chosen transport.

use anyhow::Context;

use metronome_comms::{
    inproc::{InprocComms, InprocNetwork},
    tcp::TcpComms,
    CommsBroker, CommsDriver,
};
use metronome_core::RouteId;
use metronome_kernel::{
    broker::BrokerRole,
    core::CoreRole,
    Broker, BrokerConfig, Core, CoreConfig,
};

/// A running federation: one root broker and its cores, with their comms.
pub struct Federation<D: CommsDriver> {
    pub broker: Broker,
    pub cores: Vec<Core>,
    broker_comms: CommsBroker<D, BrokerRole>,
    core_comms: Vec<CommsBroker<D, CoreRole>>,
}

impl<D: CommsDriver> Federation<D> {
    /// Tear the whole federation down: cores first, then the broker.
    pub async fn shutdown(mut self) {
        for comms in &mut self.core_comms {
            comms.disconnect().await;
        }
        self.broker_comms.disconnect().await;
        for core in &mut self.cores {
            core.shutdown().await;
        }
        self.broker.shutdown().await;
    }
}

/// Build a broker plus `core_count` cores over in-process queues.
pub async fn build_inproc_federation(
    federation: &str,
    core_count: usize,
    expected_federates: usize,
) -> anyhow::Result<Federation<InprocComms>> {
    let network = InprocNetwork::new();
    let broker_name = format!("{federation}_broker");

    let broker = Broker::new(BrokerConfig::root(&broker_name, expected_federates));
    let mut broker_comms =
        CommsBroker::new(InprocComms::new(network.clone()), broker.role());
    broker_comms.comms().set_name(&broker_name);
    {
        let transmit = broker_comms.comms().handle();
        let routes = transmit.clone();
        broker
            .attach_comms(
                move |route, cmd| transmit.transmit(route, cmd),
                move |route, info| routes.add_route(route, &info),
            )
            .await
            .context("attaching broker comms")?;
    }
    if !broker_comms.connect().await {
        anyhow::bail!("broker comms failed to connect");
    }

    let mut cores = Vec::with_capacity(core_count);
    let mut core_comms = Vec::with_capacity(core_count);
    for index in 0..core_count {
        let core_name = format!("{federation}_core{index}");
        let core = Core::new(CoreConfig::with_broker(&core_name));
        let mut comms = CommsBroker::new(InprocComms::new(network.clone()), core.role());
        comms.comms().set_name(&core_name);
        comms.comms().load_target_info(&core_name, &broker_name);
        if !comms.connect().await {
            anyhow::bail!("core '{core_name}' comms failed to connect");
        }
        let transmit = comms.comms().handle();
        core.attach_parent(move |cmd| transmit.transmit(RouteId::PARENT, cmd), &core_name)
            .await
            .context("attaching core to broker")?;
        cores.push(core);
        core_comms.push(comms);
    }

    Ok(Federation { broker, cores, broker_comms, core_comms })
}

/// Build a broker plus cores over TCP on loopback. `core_ports` preassigns
/// each core's listening port so addresses are known before negotiation.
pub async fn build_tcp_federation(
    federation: &str,
    broker_port: u16,
    core_ports: &[u16],
    expected_federates: usize,
) -> anyhow::Result<Federation<TcpComms>> {
    let broker_name = format!("{federation}_broker");

    let broker = Broker::new(BrokerConfig::root(&broker_name, expected_federates));
    let mut broker_comms =
        CommsBroker::new(TcpComms::new().with_local_port(broker_port), broker.role());
    broker_comms.comms().set_name(&broker_name);
    broker_comms.comms().modify_config(|config| {
        config.local_target = "127.0.0.1".to_string();
        config.server_mode = true;
    });
    {
        let transmit = broker_comms.comms().handle();
        let routes = transmit.clone();
        broker
            .attach_comms(
                move |route, cmd| transmit.transmit(route, cmd),
                move |route, info| routes.add_route(route, &info),
            )
            .await
            .context("attaching broker comms")?;
    }
    if !broker_comms.connect().await {
        anyhow::bail!("broker comms failed to connect on port {broker_port}");
    }

    let mut cores = Vec::with_capacity(core_ports.len());
    let mut core_comms = Vec::with_capacity(core_ports.len());
    for (index, port) in core_ports.iter().enumerate() {
        let core_name = format!("{federation}_core{index}");
        let advertised = format!("127.0.0.1:{port}");
        let core = Core::new(CoreConfig::with_broker(&core_name));
        let driver =
            TcpComms::new().with_broker_port(broker_port).with_local_port(*port);
        let mut comms = CommsBroker::new(driver, core.role());
        comms.comms().set_name(&core_name);
        comms.comms().load_target_info("127.0.0.1", "127.0.0.1");
        if !comms.connect().await {
            anyhow::bail!("core '{core_name}' comms failed to connect");
        }
        let transmit = comms.comms().handle();
        core.attach_parent(move |cmd| transmit.transmit(RouteId::PARENT, cmd), &advertised)
            .await
            .context("attaching core to broker")?;
        cores.push(core);
        core_comms.push(comms);
    }

    Ok(Federation { broker, cores, broker_comms, core_comms })
}
