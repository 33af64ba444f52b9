//! Server-only and client-only sessions talking to each other.

use std::time::Duration;

use pingpong_host::{host::reserve_port, HostLoop};
use pingpong_shared::{
    config::SessionConfig,
    net::TransportMode,
    session::Session,
    socket::SocketTransport,
};

async fn split_pair(
    mode: TransportMode,
) -> anyhow::Result<(HostLoop<SocketTransport>, HostLoop<SocketTransport>)> {
    let port = reserve_port(mode).await?;
    let addr = format!("127.0.0.1:{port}");
    let base = SessionConfig {
        mode,
        period_ms: 40,
        frame_hz: 200,
        ..Default::default()
    };

    let server_cfg = SessionConfig {
        listen_addr: Some(addr.clone()),
        peer_addr: None,
        ..base.clone()
    };
    let client_cfg = SessionConfig {
        listen_addr: None,
        peer_addr: Some(addr),
        ..base
    };

    let mut server = Session::new(&server_cfg, SocketTransport::new())?;
    server.open().await;
    let mut client = Session::new(&client_cfg, SocketTransport::new())?;
    client.open().await;

    Ok((
        HostLoop::new(server, server_cfg.frame_interval()),
        HostLoop::new(client, client_cfg.frame_interval()),
    ))
}

async fn drive(
    server: &mut HostLoop<SocketTransport>,
    client: &mut HostLoop<SocketTransport>,
    frames: usize,
) {
    for _ in 0..frames {
        server.frame().await;
        client.frame().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_split_roles_exchange() -> anyhow::Result<()> {
    let (mut server, mut client) = split_pair(TransportMode::ConnectionOriented).await?;
    drive(&mut server, &mut client, 150).await;

    assert!(server.session().is_connected());
    assert!(client.session().is_connected());

    let s = server.session().stats();
    let c = client.session().stats();
    assert!(c.pings_sent >= 2, "{c:?}");
    assert!(s.pings_received >= 1, "{s:?}");
    assert!(s.pongs_sent >= 1, "{s:?}");
    assert!(c.pongs_received >= 1, "{c:?}");
    // The listening side never opens with a Ping of its own.
    assert_eq!(s.pongs_received, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_split_roles_exchange() -> anyhow::Result<()> {
    let (mut server, mut client) = split_pair(TransportMode::Connectionless).await?;
    drive(&mut server, &mut client, 150).await;

    let s = server.session().stats();
    let c = client.session().stats();
    assert!(c.pings_sent >= 2, "{c:?}");
    assert!(s.pongs_sent >= 1, "{s:?}");
    assert!(c.pongs_received >= 1, "{c:?}");
    assert_eq!(s.send_errors, 0);
    Ok(())
}
