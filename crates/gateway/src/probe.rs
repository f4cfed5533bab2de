use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bare TCP connect to `ip:port`. No handshake: connecting is the only signal.
pub async fn is_reachable(ip: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe of {}:{} failed: {}", ip, port, e);
            false
        }
        Err(_) => {
            debug!("Probe of {}:{} timed out after {:?}", ip, port, timeout);
            false
        }
    }
}
