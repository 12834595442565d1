//! Integration tests for channels over real TCP sockets.
//!
//! An acceptor and a connector are wired across loopback so both ends of
//! every exchange are in-process channels.

use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use bitcoin_network_channel::{
    Acceptor, Authority, Channel, ChannelOptions, Connector, Error, StopSignal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn options() -> ChannelOptions {
    ChannelOptions {
        magic: Magic::BITCOIN,
        protocol_minimum: 31402,
        inactivity: Duration::from_secs(30),
        expiration: Duration::from_secs(60),
    }
}

/// An accepted/connected channel pair over loopback TCP.
async fn channel_pair(signal: &StopSignal) -> (Arc<Channel>, Arc<Channel>) {
    let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), options(), signal.token())
        .await
        .unwrap();
    let authority = Authority::from(acceptor.local_addr().unwrap());
    let connector = Connector::new(options(), Duration::from_secs(5), signal.token());

    let accepted = tokio::spawn(async move { acceptor.accept().await });
    let outbound = connector.connect(&authority).await.unwrap();
    let inbound = accepted.await.unwrap().unwrap();
    (outbound, inbound)
}

/// Forward every delivery of `command` on `channel` into a stream.
fn deliveries(
    channel: &Channel,
    command: &str,
) -> tokio::sync::mpsc::UnboundedReceiver<Result<NetworkMessage, Error>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    channel.subscribe(
        command,
        Box::new(move |event| {
            let owned = match event {
                Ok(message) => Ok(message.clone()),
                Err(code) => Err(code),
            };
            tx.send(owned).is_ok()
        }),
    );
    rx
}

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let signal = StopSignal::new();
    let (outbound, inbound) = channel_pair(&signal).await;

    let mut outbound_pongs = deliveries(&outbound, "pong");
    let mut inbound_pings = deliveries(&inbound, "ping");
    outbound.start();
    inbound.start();

    outbound.send(NetworkMessage::Ping(11)).await.unwrap();
    match inbound_pings.recv().await {
        Some(Ok(NetworkMessage::Ping(nonce))) => assert_eq!(nonce, 11),
        other => panic!("expected ping, got {other:?}"),
    }

    inbound.send(NetworkMessage::Pong(11)).await.unwrap();
    match outbound_pongs.recv().await {
        Some(Ok(NetworkMessage::Pong(nonce))) => assert_eq!(nonce, 11),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deliveries_preserve_wire_order() {
    let signal = StopSignal::new();
    let (outbound, inbound) = channel_pair(&signal).await;

    let mut pings = deliveries(&inbound, "ping");
    outbound.start();
    inbound.start();

    for nonce in 0..32u64 {
        outbound.send(NetworkMessage::Ping(nonce)).await.unwrap();
    }
    for expected in 0..32u64 {
        match pings.recv().await {
            Some(Ok(NetworkMessage::Ping(nonce))) => assert_eq!(nonce, expected),
            other => panic!("expected ping {expected}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_stop_reaches_the_remote_end() {
    let signal = StopSignal::new();
    let (outbound, inbound) = channel_pair(&signal).await;
    outbound.start();
    inbound.start();

    outbound.stop(Error::ServiceStopped);

    // The remote side observes the closed transport and stops itself.
    let code = timeout(Duration::from_secs(5), inbound.wait_stop())
        .await
        .expect("remote end should observe the close");
    assert!(matches!(code, Error::ChannelTransport(_)));
}

#[tokio::test]
async fn test_subscribers_observe_stop_exactly_once() {
    let signal = StopSignal::new();
    let (outbound, _inbound) = channel_pair(&signal).await;

    let mut pings = deliveries(&outbound, "ping");
    outbound.start();
    outbound.stop(Error::ServiceStopped);

    assert_eq!(pings.recv().await, Some(Err(Error::ServiceStopped)));
    assert_eq!(pings.recv().await, None);
}

#[tokio::test]
async fn test_stop_signal_cancels_pending_accept() {
    let signal = StopSignal::new();
    let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), options(), signal.token())
        .await
        .unwrap();

    let pending = tokio::spawn(async move { acceptor.accept().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    signal.fire();

    let outcome = timeout(Duration::from_secs(5), pending)
        .await
        .expect("accept should resolve on stop")
        .unwrap();
    assert_eq!(outcome.err(), Some(Error::ServiceStopped));
}
