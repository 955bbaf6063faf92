//! Service identification from server banners.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::flow::{FlowIdent, TransportProtocol};

/// Receives the leading server bytes of finished flows.
pub trait ServiceIdentifier: Send + Sync {
    /// Fire-and-forget; called at most once per flow direction.
    fn identify(&self, banner: &[u8], flow: &FlowIdent, first_seen_us: i64, transport: TransportProtocol);

    /// Number of distinct services seen so far.
    fn service_count(&self) -> usize {
        0
    }
}

/// A server endpoint and the flows that talked to it.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    /// `ip:port` of the server.
    pub endpoint: String,
    pub transport: TransportProtocol,
    /// Well-known name for the port, or empty.
    pub name: &'static str,
    pub first_seen_us: i64,
    pub banner: Vec<u8>,
    pub flows: Vec<String>,
}

/// In-memory service table keyed by endpoint and transport.
#[derive(Debug, Default)]
pub struct ServiceStore {
    services: Mutex<HashMap<String, Service>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &str, transport: TransportProtocol) -> Option<Service> {
        self.services
            .lock()
            .get(&service_key(endpoint, transport))
            .cloned()
    }

    /// All services, ordered by endpoint.
    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<_> = self.services.lock().values().cloned().collect();
        services.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        services
    }
}

fn service_key(endpoint: &str, transport: TransportProtocol) -> String {
    format!("{endpoint}/{transport}")
}

impl ServiceIdentifier for ServiceStore {
    fn identify(&self, banner: &[u8], flow: &FlowIdent, first_seen_us: i64, transport: TransportProtocol) {
        if banner.is_empty() {
            return;
        }
        let endpoint = flow.dst.to_string();
        let flow_name = flow.to_string();
        let mut services = self.services.lock();

        if let Some(service) = services.get_mut(&service_key(&endpoint, transport)) {
            if !service.flows.contains(&flow_name) {
                service.flows.push(flow_name);
            }
            return;
        }

        let name = port_name(flow.dst.port(), transport);
        tracing::debug!(%endpoint, %transport, name, "new service");
        services.insert(
            service_key(&endpoint, transport),
            Service {
                endpoint,
                transport,
                name,
                first_seen_us,
                banner: banner.to_vec(),
                flows: vec![flow_name],
            },
        );
    }

    fn service_count(&self) -> usize {
        self.services.lock().len()
    }
}

/// Well-known service name for a server port.
pub fn port_name(port: u16, transport: TransportProtocol) -> &'static str {
    match (port, transport) {
        (21, TransportProtocol::Tcp) => "ftp",
        (22, TransportProtocol::Tcp) => "ssh",
        (23, TransportProtocol::Tcp) => "telnet",
        (25, TransportProtocol::Tcp) => "smtp",
        (53, _) => "domain",
        (67, TransportProtocol::Udp) => "bootps",
        (80, TransportProtocol::Tcp) => "http",
        (110, TransportProtocol::Tcp) => "pop3",
        (123, TransportProtocol::Udp) => "ntp",
        (143, TransportProtocol::Tcp) => "imap",
        (161, TransportProtocol::Udp) => "snmp",
        (443, _) => "https",
        (993, TransportProtocol::Tcp) => "imaps",
        (995, TransportProtocol::Tcp) => "pop3s",
        (3306, TransportProtocol::Tcp) => "mysql",
        (5432, TransportProtocol::Tcp) => "postgresql",
        (6379, TransportProtocol::Tcp) => "redis",
        (8080, TransportProtocol::Tcp) => "http-alt",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(client_port: u16) -> FlowIdent {
        FlowIdent::new(
            format!("10.0.0.1:{client_port}").parse().unwrap(),
            "10.0.0.2:22".parse().unwrap(),
        )
    }

    // Test 1: First banner creates the service
    #[test]
    fn test_new_service() {
        let store = ServiceStore::new();
        store.identify(b"SSH-2.0-OpenSSH_9.6\r\n", &flow(50000), 7, TransportProtocol::Tcp);

        assert_eq!(store.service_count(), 1);
        let service = store.get("10.0.0.2:22", TransportProtocol::Tcp).unwrap();
        assert_eq!(service.name, "ssh");
        assert_eq!(service.first_seen_us, 7);
        assert_eq!(service.flows, vec!["10.0.0.1:50000->10.0.0.2:22"]);
    }

    // Test 2: Known endpoint only collects new flows
    #[test]
    fn test_known_service_appends_flow() {
        let store = ServiceStore::new();
        store.identify(b"SSH-2.0-a", &flow(50000), 1, TransportProtocol::Tcp);
        store.identify(b"SSH-2.0-b", &flow(50001), 2, TransportProtocol::Tcp);
        store.identify(b"SSH-2.0-b", &flow(50001), 3, TransportProtocol::Tcp);

        assert_eq!(store.service_count(), 1);
        let service = store.get("10.0.0.2:22", TransportProtocol::Tcp).unwrap();
        assert_eq!(service.flows.len(), 2);
        assert_eq!(service.banner, b"SSH-2.0-a");
    }

    // Test 3: Empty banners and transports are distinguished
    #[test]
    fn test_empty_banner_and_transport() {
        let store = ServiceStore::new();
        store.identify(b"", &flow(50000), 1, TransportProtocol::Tcp);
        assert_eq!(store.service_count(), 0);

        store.identify(b"x", &flow(50000), 1, TransportProtocol::Tcp);
        store.identify(b"x", &flow(50000), 1, TransportProtocol::Udp);
        assert_eq!(store.service_count(), 2);
        assert_eq!(store.services().len(), 2);
    }
}
