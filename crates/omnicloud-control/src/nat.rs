//! NAT reachability probe.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Dial-back timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempt a TCP dial back to `client_ip:port`. Returns whether the peer
/// accepted within the timeout; sites cache the result and start the relay
/// client when unreachable.
pub async fn probe_nat(client_ip: IpAddr, port: u16) -> bool {
    let target = SocketAddr::new(client_ip, port);
    let reachable = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await,
        Ok(Ok(_))
    );
    debug!(target = %target, reachable, "nat probe");
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepting = tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        assert!(probe_nat(addr.ip(), addr.port()).await);
        accepting.abort();
    }

    #[tokio::test]
    async fn probe_fails_against_a_closed_port() {
        // Bind then drop to find a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!probe_nat(addr.ip(), addr.port()).await);
    }
}
