use std::net::SocketAddr;

use netx::{Netx, Network};
use rand::seq::SliceRandom;

/// `localhost` resolves to IPv4 when the network leaves the family open, as local servers rarely
/// listen on IPv6 unless asked to.
#[tokio::test]
async fn localhost_prefers_ipv4() {
    let netx = Netx::default();
    let mut checks = [
        (Network::Tcp, false),
        (Network::Udp, false),
        (Network::Tcp4, false),
        (Network::Udp4, false),
        (Network::Tcp6, true),
        (Network::Udp6, true),
    ];
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        checks.shuffle(&mut rng);
        for (network, want_v6) in checks {
            let addr = if network.is_tcp() {
                netx.resolve(network, "localhost:999").await.unwrap()
            } else {
                netx.resolve_udp(network, "localhost:999").await.unwrap()
            };
            assert_eq!(addr.port(), 999);
            assert_eq!(
                addr.is_ipv6(),
                want_v6,
                "{network} resolved localhost to {addr}"
            );
            assert!(addr.ip().is_loopback());
        }
    }
}

#[tokio::test]
async fn literals_follow_network_family() {
    let netx = Netx::default();
    let addr = netx.resolve(Network::Tcp, "[::1]:80").await.unwrap();
    assert_eq!(addr, "[::1]:80".parse::<SocketAddr>().unwrap());
    assert!(netx.resolve(Network::Tcp4, "[::1]:80").await.is_err());
    assert!(netx.resolve_udp(Network::Udp6, "127.0.0.1:80").await.is_err());
    assert!(netx.resolve(Network::Udp, "127.0.0.1:80").await.is_err());
}

#[tokio::test]
async fn resolve_ignores_nat64_translation() {
    let netx = Netx::default();
    let addr = netx.resolve(Network::Tcp, "93.184.216.34:80").await.unwrap();
    assert_eq!(addr, "93.184.216.34:80".parse::<SocketAddr>().unwrap());
}
