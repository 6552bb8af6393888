//! Pre-start "is this port free" probe.
//!
//! This probe verifies the port is *free* immediately before a service
//! binds it. It races with the service actually binding it and does not
//! confirm the service is up; that is a known, deliberate limitation of
//! this probe rather than a readiness check in the usual sense.

use super::{Probe, ProbeError};

pub struct PortFreeProbe {
    port: u16,
}

impl PortFreeProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Probe for PortFreeProbe {
    async fn check(&mut self) -> Result<bool, ProbeError> {
        match tokio::net::TcpListener::bind(("127.0.0.1", self.port)).await {
            Ok(listener) => {
                drop(listener);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_healthy() {
        // bind to port 0 to get an OS-assigned free port, then release it
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut probe = PortFreeProbe::new(port);
        assert!(probe.check().await.unwrap());
    }

    #[tokio::test]
    async fn occupied_port_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut probe = PortFreeProbe::new(port);
        assert!(!probe.check().await.unwrap());
    }
}
