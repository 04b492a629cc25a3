use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::RecvTimeoutError;

use crate::{
    MetricsError, ShutdownError, TagSet,
    backend::{BackendClient, BackendKind},
    internal::wire::{MetricKind, format_sample},
};

#[derive(Debug)]
struct Transport {
    socket: UdpSocket,
    target: SocketAddr,
}

/// Sends one UDP datagram per sample to a sampling-protocol agent.
///
/// Sends never block: the socket is non-blocking and a datagram which cannot be sent
/// immediately is dropped.
#[derive(Debug)]
pub struct UdpSampleClient {
    address: String,
    transport: Arc<OnceLock<Transport>>,
    closed: AtomicBool,
}

impl UdpSampleClient {
    /// Resolve `host:port` and open a socket to it.
    ///
    /// Resolution runs on a helper thread. If it has not completed within `connect_timeout`, a
    /// warning is logged and the client is returned anyway; samples are dropped until
    /// resolution completes.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::TransportConstructionFailed`] if the host does not resolve or no
    /// socket can be bound (within `connect_timeout`).
    pub fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, MetricsError> {
        let address = format!("{host}:{port}");
        let transport = Arc::new(OnceLock::new());
        let construction_failed = |source: io::Error| MetricsError::TransportConstructionFailed {
            address: address.clone(),
            source: source.into(),
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let host = host.to_owned();
            let transport = transport.clone();
            thread::Builder::new()
                .name("service-metrics-resolve".into())
                .spawn(move || {
                    let result = open_transport(&host, port).map(|opened| {
                        let target = opened.target;
                        let _ = transport.set(opened);
                        target
                    });
                    // nobody listening if construction already timed out
                    let _ = tx.send(result);
                })
                .map_err(construction_failed)?;
        }

        match rx.recv_timeout(connect_timeout) {
            Ok(Ok(target)) => {
                tracing::debug!(%address, %target, "resolved sampling backend");
            }
            Ok(Err(error)) => return Err(construction_failed(error)),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    %address,
                    timeout = ?connect_timeout,
                    "sampling backend did not resolve in time; samples are dropped until it does"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(construction_failed(io::Error::other(
                    "resolver thread exited without a result",
                )));
            }
        }

        Ok(Self {
            address,
            transport,
            closed: AtomicBool::new(false),
        })
    }

    /// The configured `host:port`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn send(&self, name: &str, value: impl std::fmt::Display, kind: MetricKind, tags: &TagSet) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let Some(transport) = self.transport.get() else {
            tracing::trace!(address = %self.address, "backend not resolved yet; dropping sample");
            return;
        };
        let datagram = format_sample(name, value, kind, tags);
        if let Err(error) = transport
            .socket
            .send_to(datagram.as_bytes(), transport.target)
        {
            tracing::trace!(%error, address = %self.address, "dropping sample");
        }
    }
}

fn open_transport(host: &str, port: u16) -> io::Result<Transport> {
    let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    })?;
    let bind: SocketAddr = if target.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.set_nonblocking(true)?;
    Ok(Transport { socket, target })
}

impl BackendClient for UdpSampleClient {
    fn emit_count(&self, name: &str, delta: u64, tags: &TagSet) {
        self.send(name, delta, MetricKind::Count, tags);
    }

    fn emit_timing(&self, name: &str, duration_ms: f64, tags: &TagSet) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            tracing::debug!(name, duration_ms, "dropping invalid timing");
            return;
        }
        self.send(name, duration_ms, MetricKind::Timing, tags);
    }

    fn emit_gauge_sample(&self, name: &str, value: f64, tags: &TagSet) {
        if !value.is_finite() {
            tracing::debug!(name, value, "dropping non-finite gauge sample");
            return;
        }
        self.send(name, value, MetricKind::Gauge, tags);
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Udp
    }

    fn shutdown(&self, _timeout: Duration) -> Result<(), ShutdownError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::UdpSocket, time::Duration};

    use super::UdpSampleClient;
    use crate::{TagSet, backend::BackendClient};

    fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 512];
        let len = socket.recv(&mut buf).unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[test]
    fn test_sends_one_datagram_per_sample() {
        let (socket, port) = receiver();
        let client = UdpSampleClient::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        let tags = TagSet::from_iter([("env", "test")]);

        client.emit_count("svc.Requests", 5, &tags);
        client.emit_timing("svc.Latency", 12.5, &tags);
        client.emit_gauge_sample("svc.Depth", 3.0, &TagSet::new());

        assert_eq!(recv(&socket), "svc.Requests#env=test:5|c");
        assert_eq!(recv(&socket), "svc.Latency#env=test:12.5|ms");
        assert_eq!(recv(&socket), "svc.Depth:3|g");
    }

    #[test]
    fn test_invalid_values_and_closed_client_send_nothing() {
        let (socket, port) = receiver();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let client = UdpSampleClient::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();

        client.emit_timing("svc.Latency", -1.0, &TagSet::new());
        client.emit_gauge_sample("svc.Depth", f64::NAN, &TagSet::new());
        client.shutdown(Duration::from_secs(1)).unwrap();
        client.emit_count("svc.Requests", 1, &TagSet::new());

        let mut buf = [0u8; 64];
        assert!(socket.recv(&mut buf).is_err());
    }

    #[test]
    fn test_address() {
        let client = UdpSampleClient::connect("127.0.0.1", 8125, Duration::from_secs(1)).unwrap();
        assert_eq!(client.address(), "127.0.0.1:8125");
    }
}
