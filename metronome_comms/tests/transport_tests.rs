//! Transport integration: connect/disconnect contracts, port negotiation,
//! broker redirect, and route management on the concrete drivers.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::codec::Framed;

use metronome_comms::{
    inproc::{InprocComms, InprocNetwork},
    tcp::TcpComms,
    tcp_ss::TcpCommsSs,
    udp::UdpComms,
    ActionCodec, CommsInterface,
};
use metronome_core::{
    command::{protocol, Action, ActionMessage},
    RouteId, SmallBuffer,
};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn collector() -> (mpsc::UnboundedSender<ActionMessage>, mpsc::UnboundedReceiver<ActionMessage>) {
    mpsc::unbounded_channel()
}

async fn expect_payload(
    rx: &mut mpsc::UnboundedReceiver<ActionMessage>,
    payload: &[u8],
) -> ActionMessage {
    let msg = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = rx.recv().await.expect("collector closed");
            if !msg.is_protocol_command() {
                break msg;
            }
        }
    })
    .await
    .expect("timed out waiting for delivery");
    assert_eq!(msg.payload.as_bytes(), payload);
    msg
}

fn data_message(payload: &str) -> ActionMessage {
    let mut cmd = ActionMessage::new(Action::Publish);
    cmd.payload = SmallBuffer::from(payload);
    cmd
}

#[test_log::test(tokio::test)]
async fn inproc_pair_delivers_and_survives_reconnect_cycle() {
    let network = InprocNetwork::new();

    let mut server = CommsInterface::new(InprocComms::new(network.clone()));
    let (tx, mut rx) = collector();
    server.set_callback(move |m| {
        let _ = tx.send(m);
    });
    server.set_name("hub");
    assert!(server.connect().await);

    let mut client = CommsInterface::new(InprocComms::new(network.clone()));
    client.set_callback(|_| {});
    client.set_name("leaf");
    client.load_target_info("leaf", "hub");
    assert!(client.connect().await);

    client.transmit(RouteId::PARENT, data_message("first pass"));
    expect_payload(&mut rx, b"first pass").await;

    client.disconnect().await;
    // a second disconnect is a no-op
    client.disconnect().await;

    // the name is released on teardown, so a fresh comm can rebind it
    let mut client2 = CommsInterface::new(InprocComms::new(network.clone()));
    client2.set_callback(|_| {});
    client2.set_name("leaf");
    client2.load_target_info("leaf", "hub");
    assert!(client2.connect().await, "rebind after disconnect must succeed");
    client2.transmit(RouteId::PARENT, data_message("second pass"));
    expect_payload(&mut rx, b"second pass").await;

    client2.disconnect().await;
    server.disconnect().await;
}

#[test_log::test(tokio::test)]
async fn routes_can_be_removed_and_restored() {
    let network = InprocNetwork::new();

    let mut target = CommsInterface::new(InprocComms::new(network.clone()));
    let (tx, mut rx) = collector();
    target.set_callback(move |m| {
        let _ = tx.send(m);
    });
    target.set_name("routed_target");
    assert!(target.connect().await);

    // no broker: anything unroutable is dropped
    let mut source = CommsInterface::new(InprocComms::new(network.clone()));
    source.set_callback(|_| {});
    source.set_name("routed_source");
    assert!(source.connect().await);

    let route = RouteId(7);
    source.add_route(route, "routed_target");
    source.transmit(route, data_message("one"));
    expect_payload(&mut rx, b"one").await;

    source.remove_route(route);
    source.transmit(route, data_message("dropped"));
    // route removal travels the normal band while route creation travels
    // the priority band; let the removal drain before re-adding
    tokio::time::sleep(Duration::from_millis(100)).await;

    source.add_route(route, "routed_target");
    source.transmit(route, data_message("two"));
    // the dropped message never arrives; the restored route works
    let msg = expect_payload(&mut rx, b"two").await;
    assert_eq!(msg.payload.as_bytes(), b"two");

    source.disconnect().await;
    target.disconnect().await;
}

#[test_log::test(tokio::test)]
async fn tcp_negotiates_ports_through_the_broker() {
    let broker_port = free_port();

    let mut broker = CommsInterface::new(TcpComms::new().with_local_port(broker_port));
    let (tx, mut rx) = collector();
    broker.set_callback(move |m| {
        let _ = tx.send(m);
    });
    broker.set_name("tcp_broker");
    broker.modify_config(|c| {
        c.local_target = "127.0.0.1".to_string();
        c.server_mode = true;
    });
    assert!(broker.connect().await);

    let mut core = CommsInterface::new(TcpComms::new().with_broker_port(broker_port));
    core.set_callback(|_| {});
    core.set_name("tcp_core");
    core.load_target_info("127.0.0.1", "127.0.0.1");
    assert!(core.connect().await, "negotiation against the broker must succeed");

    core.transmit(RouteId::PARENT, data_message("negotiated"));
    expect_payload(&mut rx, b"negotiated").await;

    core.disconnect().await;
    broker.disconnect().await;
}

#[test_log::test(tokio::test)]
async fn tcp_follows_a_broker_redirect() {
    let old_port = free_port();
    let new_port = free_port();

    // the stale broker answers every port request with a redirect
    let stale = TcpListener::bind(("127.0.0.1", old_port)).await.unwrap();
    let redirect_to = format!("127.0.0.1:{new_port}");
    tokio::spawn(async move {
        while let Ok((stream, _)) = stale.accept().await {
            let redirect_to = redirect_to.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, ActionCodec::new());
                while let Some(Ok(cmd)) = framed.next().await {
                    if cmd.is_protocol_command() && cmd.message_id == protocol::REQUEST_PORTS {
                        let mut reply =
                            ActionMessage::protocol(protocol::NEW_BROKER_INFORMATION);
                        reply.string_data = vec![redirect_to.clone()];
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let mut real_broker = CommsInterface::new(TcpComms::new().with_local_port(new_port));
    let (tx, mut rx) = collector();
    real_broker.set_callback(move |m| {
        let _ = tx.send(m);
    });
    real_broker.set_name("real_broker");
    real_broker.modify_config(|c| {
        c.local_target = "127.0.0.1".to_string();
        c.server_mode = true;
    });
    assert!(real_broker.connect().await);

    let mut core = CommsInterface::new(TcpComms::new().with_broker_port(old_port));
    core.set_callback(|_| {});
    core.set_name("redirected_core");
    core.load_target_info("127.0.0.1", "127.0.0.1");
    assert!(core.connect().await, "core must follow the redirect and finish negotiation");

    core.transmit(RouteId::PARENT, data_message("after redirect"));
    expect_payload(&mut rx, b"after redirect").await;

    core.disconnect().await;
    real_broker.disconnect().await;
}

#[test_log::test(tokio::test)]
async fn udp_datagrams_carry_messages() {
    let broker_port = free_port();

    let mut broker = CommsInterface::new(UdpComms::new().with_local_port(broker_port));
    let (tx, mut rx) = collector();
    broker.set_callback(move |m| {
        let _ = tx.send(m);
    });
    broker.set_name("udp_broker");
    broker.modify_config(|c| {
        c.local_target = "127.0.0.1".to_string();
        c.server_mode = true;
    });
    assert!(broker.connect().await);

    let mut core = CommsInterface::new(UdpComms::new().with_broker_port(broker_port));
    core.set_callback(|_| {});
    core.set_name("udp_core");
    core.load_target_info("127.0.0.1", "127.0.0.1");
    assert!(core.connect().await);

    core.transmit(RouteId::PARENT, data_message("datagram"));
    expect_payload(&mut rx, b"datagram").await;

    core.disconnect().await;
    broker.disconnect().await;
}

#[test_log::test(tokio::test)]
async fn single_socket_handshake_and_delivery() {
    let port = free_port();

    let mut server = CommsInterface::new(TcpCommsSs::new().with_local_port(port));
    let (tx, mut rx) = collector();
    server.set_callback(move |m| {
        let _ = tx.send(m);
    });
    server.set_name("ss_server");
    server.modify_config(|c| {
        c.local_target = "127.0.0.1".to_string();
        c.server_mode = true;
    });
    assert!(server.connect().await);

    let mut client = CommsInterface::new(TcpCommsSs::new().with_broker_port(port));
    client.set_callback(|_| {});
    client.set_name("ss_client");
    client.load_target_info("127.0.0.1", "127.0.0.1");
    assert!(client.connect().await, "connection-information handshake must complete");

    client.transmit(RouteId::PARENT, data_message("one socket"));
    expect_payload(&mut rx, b"one socket").await;

    client.disconnect().await;
    server.disconnect().await;
}
