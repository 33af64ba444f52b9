//! Setup failures are recorded and keep the session disconnected.

use std::time::Duration;

use pingpong_host::HostLoop;
use pingpong_shared::{
    config::SessionConfig,
    net::{Role, TransportMode},
    session::{Session, TickOutcome},
    socket::SocketTransport,
};
use tokio::net::UdpSocket;

#[tokio::test]
async fn taken_port_leaves_session_disconnected() -> anyhow::Result<()> {
    let squatter = UdpSocket::bind("127.0.0.1:0").await?;
    let port = squatter.local_addr()?.port();

    let cfg = SessionConfig {
        mode: TransportMode::Connectionless,
        listen_addr: Some(format!("127.0.0.1:{port}")),
        peer_addr: None,
        period_ms: 20,
        frame_hz: 200,
    };
    let mut session = Session::new(&cfg, SocketTransport::new())?;
    session.open().await;

    let failures = session.setup_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].role, Role::Server);
    assert!(failures[0].message.contains("udp bind"), "{}", failures[0]);
    assert!(failures[0].os_error.is_some());

    let mut host = HostLoop::new(session, cfg.frame_interval());
    host.run_for_frames(20).await?;
    assert!(!host.session().is_connected());
    assert_eq!(host.session_mut().tick(Duration::from_secs(1)), TickOutcome::default());
    Ok(())
}

#[tokio::test]
async fn refused_connect_is_recorded_once() -> anyhow::Result<()> {
    // Nothing listens on a freshly released port.
    let port = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        l.local_addr()?.port()
    };

    let cfg = SessionConfig {
        mode: TransportMode::ConnectionOriented,
        listen_addr: None,
        peer_addr: Some(format!("127.0.0.1:{port}")),
        period_ms: 20,
        frame_hz: 200,
    };
    let mut session = Session::new(&cfg, SocketTransport::new())?;
    session.open().await;

    let mut host = HostLoop::new(session, cfg.frame_interval());
    host.run_for_frames(40).await?;

    let session = host.session();
    assert!(!session.is_connected());
    assert_eq!(session.setup_failures().len(), 1, "{:?}", session.setup_failures());
    let failure = &session.setup_failures()[0];
    assert_eq!(failure.role, Role::Client);
    assert!(failure.message.contains("tcp connect"), "{failure}");
    Ok(())
}
