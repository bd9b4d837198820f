//! Datagram plumbing between teammates.
//!
//! A [`PacketListener`] runs on its own thread, blocked on the socket. Every datagram it receives is
//! decoded into an [`AgentReading`] and appended to the shared [`AgentObservationQueue`], which the
//! fusion side drains periodically. Sending is fire-and-forget through [`UdpTransport`].
use crate::error::{Result, TrackingError};
use crate::messages::AgentPacket;
use crate::sensor::AgentReading;

use log::{debug, error, warn};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECEIVE_BUFFER_SIZE: usize = 8192;
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded queue of teammate reports shared between the listener thread and the fusion loop.
///
/// When full, the oldest reports are dropped first.
#[derive(Clone, Debug)]
pub struct AgentObservationQueue {
    inner: Arc<Mutex<Vec<AgentReading>>>,
    capacity: usize,
}
impl AgentObservationQueue {
    pub fn new(capacity: usize) -> Self {
        AgentObservationQueue {
            inner: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }
    /// Queue sized for `network_frequency` fusion runs per two seconds: the last five seconds of
    /// reports at that rate.
    pub fn for_network_frequency(network_frequency: f64) -> Self {
        Self::new(((network_frequency * 5.0).round() as usize).max(1))
    }
    fn lock(&self) -> MutexGuard<'_, Vec<AgentReading>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn push(&self, reading: AgentReading) {
        let mut queue = self.lock();
        queue.push(reading);
        if queue.len() > self.capacity {
            let excess = queue.len() - self.capacity;
            queue.drain(..excess);
        }
    }
    /// Take every queued report, oldest first, leaving the queue empty.
    pub fn drain(&self) -> Vec<AgentReading> {
        std::mem::take(&mut *self.lock())
    }
    pub fn len(&self) -> usize {
        self.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fire-and-forget datagram sender.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}
impl UdpTransport {
    /// Sender on an ephemeral local port.
    pub fn new() -> Result<Self> {
        Ok(UdpTransport {
            socket: UdpSocket::bind("0.0.0.0:0")?,
        })
    }
    pub fn from_socket(socket: UdpSocket) -> Self {
        UdpTransport { socket }
    }
    /// Send `payload` to `target`. Failures are logged and reported as `false`.
    pub fn send(&self, payload: &str, target: SocketAddr) -> bool {
        match self.socket.send_to(payload.as_bytes(), target) {
            Ok(_) => true,
            Err(e) => {
                error!("error sending {} bytes to {}: {}", payload.len(), target, e);
                false
            }
        }
    }
    /// Send `payload` to every target, returning how many sends succeeded.
    pub fn broadcast<'a, I>(&self, payload: &str, targets: I) -> usize
    where
        I: IntoIterator<Item = &'a SocketAddr>,
    {
        targets
            .into_iter()
            .filter(|target| self.send(payload, **target))
            .count()
    }
}

/// Receives teammate packets and feeds them to an [`AgentObservationQueue`].
#[derive(Debug)]
pub struct PacketListener {
    socket: UdpSocket,
    queue: AgentObservationQueue,
}
impl PacketListener {
    pub fn bind<A: ToSocketAddrs>(address: A, queue: AgentObservationQueue) -> Result<Self> {
        Ok(PacketListener {
            socket: UdpSocket::bind(address)?,
            queue,
        })
    }
    pub fn from_socket(socket: UdpSocket, queue: AgentObservationQueue) -> Self {
        PacketListener { socket, queue }
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
    /// Decode one datagram and queue the report it carries.
    pub fn handle_datagram(&self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TrackingError::MalformedPacket(format!("not utf-8: {}", e)))?;
        let packet = AgentPacket::from_datagram(text.trim_end_matches(['\0', '\n', '\r']))?;
        debug!(
            "received {} estimations from {}:{}",
            packet.estimations.len(),
            packet.ip,
            packet.port
        );
        self.queue.push(packet.into());
        Ok(())
    }
    /// Receive until `stop` is raised. Receive and decode failures are logged and skipped.
    pub fn run(&self, stop: &AtomicBool) -> io::Result<()> {
        self.socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        while !stop.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buffer) {
                Ok((n, source)) => {
                    if let Err(e) = self.handle_datagram(&buffer[..n]) {
                        warn!("dropping datagram from {}: {}", source, e);
                    }
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => error!("error receiving datagram: {}", e),
            }
        }
        Ok(())
    }
    /// Run the listener on a dedicated thread.
    pub fn spawn(self) -> Result<ListenerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("ptrack-listener".to_string())
            .spawn(move || {
                if let Err(e) = self.run(&flag) {
                    error!("listener stopped: {}", e);
                }
            })?;
        Ok(ListenerHandle { stop, handle })
    }
}

/// Running listener thread.
#[derive(Debug)]
pub struct ListenerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}
impl ListenerHandle {
    /// Ask the listener to stop and wait for it.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("listener thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Estimations, Observation};
    use crate::{Pose2, Timestamp};
    use nalgebra::Point2;
    use std::time::Instant;

    fn reading(ms: u64) -> AgentReading {
        AgentReading::new(Estimations::new(), Timestamp::from_millis(ms))
    }

    #[test]
    fn queue_keeps_newest_within_capacity() {
        let queue = AgentObservationQueue::new(3);
        for ms in 0..5 {
            queue.push(reading(ms));
        }
        assert_eq!(queue.len(), 3);
        let drained = queue.drain();
        let stamps: Vec<u64> = drained.iter().map(|r| r.timestamp.millis()).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
        assert!(queue.is_empty());
    }
    #[test]
    fn queue_is_shared_between_clones() {
        let queue = AgentObservationQueue::for_network_frequency(2.0);
        assert_eq!(queue.capacity(), 10);
        let producer = queue.clone();
        let worker = thread::spawn(move || {
            for ms in 0..4 {
                producer.push(reading(ms));
            }
        });
        worker.join().unwrap();
        assert_eq!(queue.drain().len(), 4);
    }
    #[test]
    fn handle_datagram_queues_report() {
        let queue = AgentObservationQueue::new(10);
        let listener = PacketListener::bind("127.0.0.1:0", queue.clone()).unwrap();
        let mut estimations = Estimations::new();
        estimations.insert(2, Observation::at(Point2::new(1.0, 0.0)));
        let packet = AgentPacket {
            ip: "127.0.0.1".to_string(),
            port: 7000,
            agent_pose: Pose2::default(),
            estimations,
            timestamp: Timestamp::from_millis(1234),
        };
        listener
            .handle_datagram(packet.to_datagram("Agent").as_bytes())
            .unwrap();
        let queued = queue.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].timestamp, Timestamp::from_millis(1234));
        assert!(queued[0].estimations.contains_key(&2));

        let bad = listener.handle_datagram(b"Agent 127.0.0.1 nonsense");
        assert!(matches!(bad, Err(TrackingError::MalformedPacket(_))));
        assert!(queue.is_empty());
    }
    #[test]
    fn idle_listener_shuts_down_within_a_poll() {
        let listener =
            PacketListener::bind("127.0.0.1:0", AgentObservationQueue::new(10)).unwrap();
        let handle = listener.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < RECEIVE_POLL_INTERVAL * 5);
    }
    #[test]
    fn loopback_delivery() {
        let queue = AgentObservationQueue::new(10);
        let listener = PacketListener::bind("127.0.0.1:0", queue.clone()).unwrap();
        let address = listener.local_addr().unwrap();
        let handle = listener.spawn().unwrap();
        let transport = UdpTransport::from_socket(UdpSocket::bind("127.0.0.1:0").unwrap());
        let packet = AgentPacket {
            ip: "127.0.0.1".to_string(),
            port: 7001,
            timestamp: Timestamp::from_millis(99),
            ..Default::default()
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && Instant::now() < deadline {
            transport.send(&packet.to_datagram("Agent"), address);
            thread::sleep(Duration::from_millis(20));
        }
        handle.shutdown();
        let received = queue.drain();
        assert!(!received.is_empty());
        assert_eq!(received[0].timestamp, Timestamp::from_millis(99));
    }
}
