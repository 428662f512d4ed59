use super::address::{AddressCache, AddressScheme};
use super::echo::EchoFilter;
use crate::config::NetworkSettings;
use crate::error::{BridgeError, Result};
use crate::events::Event;
use crate::lockfree::{Airlock, SpscProducer, WakeFn};
use arc_swap::ArcSwap;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Estimated payload cap for one outgoing bundle.
pub const MAX_BUNDLE_BYTES: usize = 1024;
/// `#bundle\0` plus the time tag.
const BUNDLE_HEADER_BYTES: usize = 16;
const PRESSURE_FILL_RATIO: f32 = 0.95;
const MAX_DATAGRAMS_PER_CYCLE: usize = 64;
const RECV_BUFFER_BYTES: usize = 8192;

/// Best-effort datagram transport.
pub trait DatagramSink: Send {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Non-blocking receive. `Ok(None)` when nothing is waiting.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let _ = buf;
        Ok(None)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn bind(listen: &str, target: &str) -> Result<Self> {
        let target = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| BridgeError::Address(target.to_string()))?;
        let socket = UdpSocket::bind(listen)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, target })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl DatagramSink for UdpTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.target).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub datagrams_sent: u64,
    pub messages_sent: u64,
    pub send_errors: u64,
    pub datagrams_received: u64,
    pub messages_received: u64,
    pub echoes_dropped: u64,
    pub decode_errors: u64,
    pub unrecognized: u64,
    pub inbound_dropped: u64,
}

fn padded(len: usize) -> usize {
    (len + 4) & !3
}

/// Encoded size of `message` as a bundle element, including its size prefix.
pub fn estimate_message_size(message: &OscMessage) -> usize {
    let args: usize = message
        .args
        .iter()
        .map(|arg| match arg {
            OscType::Long(_) | OscType::Double(_) | OscType::Time(_) => 8,
            OscType::String(s) => padded(s.len()),
            OscType::Blob(b) => 4 + ((b.len() + 3) & !3),
            OscType::Bool(_) | OscType::Nil | OscType::Inf => 0,
            _ => 4,
        })
        .sum();
    4 + padded(message.addr.len()) + padded(message.args.len() + 1) + args
}

/// Moves events between the outbound lane, the network and the router's
/// inbound queue. Driven by [`NetworkBridge`] on its own thread, or by hand
/// in tests.
pub struct BridgeWorker<S> {
    outbound: Arc<Airlock<Event>>,
    inbound: SpscProducer<Event>,
    sink: S,
    scheme: Arc<ArcSwap<AddressScheme>>,
    addresses: AddressCache,
    echo: EchoFilter,
    drained: Vec<Event>,
    pending: Vec<(OscMessage, u8)>,
    pending_bytes: usize,
    batch_size: usize,
    pressure_batch_size: usize,
    recv_buf: Box<[u8]>,
    stats: WorkerStats,
}

impl<S: DatagramSink> BridgeWorker<S> {
    pub fn new(
        outbound: Arc<Airlock<Event>>,
        inbound: SpscProducer<Event>,
        sink: S,
        scheme: Arc<ArcSwap<AddressScheme>>,
        settings: &NetworkSettings,
    ) -> Self {
        let addresses = AddressCache::new(**scheme.load());
        Self {
            outbound,
            inbound,
            sink,
            scheme,
            addresses,
            echo: EchoFilter::new(),
            drained: Vec::with_capacity(settings.pressure_batch_size),
            pending: Vec::new(),
            pending_bytes: 0,
            batch_size: settings.batch_size.max(1),
            pressure_batch_size: settings.pressure_batch_size.max(1),
            recv_buf: vec![0u8; RECV_BUFFER_BYTES].into_boxed_slice(),
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// One drain/send/receive pass. Returns the amount of work done; zero
    /// means the cycle was idle.
    pub fn run_cycle(&mut self, now_ms: u64) -> usize {
        self.sync_scheme();
        let sent = self.drain_outbound(now_ms);
        let received = self.poll_inbound(now_ms);
        sent + received
    }

    fn sync_scheme(&mut self) {
        let scheme = **self.scheme.load();
        if self.addresses.set_scheme(scheme) {
            tracing::info!(?scheme, "OSC address scheme changed");
        }
    }

    /// Returns the number of events taken from the lane.
    pub fn drain_outbound(&mut self, now_ms: u64) -> usize {
        let max = if self.outbound.fill_ratio() > PRESSURE_FILL_RATIO {
            self.pressure_batch_size
        } else {
            self.batch_size
        };

        let mut drained = std::mem::take(&mut self.drained);
        let count = self.outbound.process_batch(|event| drained.push(event), max);
        for event in drained.drain(..) {
            self.queue_event(event, now_ms);
        }
        self.drained = drained;

        self.flush(now_ms);
        count
    }

    fn queue_event(&mut self, event: Event, now_ms: u64) {
        let Some(message) = self.addresses.to_message(&event) else {
            self.stats.unrecognized += 1;
            return;
        };
        let size = estimate_message_size(&message);
        let projected = BUNDLE_HEADER_BYTES + self.pending_bytes + size;
        if !self.pending.is_empty() && projected > MAX_BUNDLE_BYTES {
            self.flush(now_ms);
        }
        self.pending_bytes += size;
        self.pending.push((message, event.channel));
    }

    fn flush(&mut self, now_ms: u64) {
        if self.pending.is_empty() {
            return;
        }
        let mut content = Vec::with_capacity(self.pending.len());
        for (message, channel) in self.pending.drain(..) {
            self.echo.record(&message, channel, now_ms);
            content.push(OscPacket::Message(message));
        }
        self.pending_bytes = 0;

        let count = content.len() as u64;
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: OscTime {
                seconds: 0,
                fractional: 1,
            },
            content,
        });
        let bytes = match rosc::encoder::encode(&bundle) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.send_errors += 1;
                let error = BridgeError::OscEncode(e.to_string());
                tracing::warn!(%error, "dropping bundle");
                return;
            }
        };
        match self.sink.send(&bytes) {
            Ok(()) => {
                self.stats.datagrams_sent += 1;
                self.stats.messages_sent += count;
            }
            Err(e) => {
                self.stats.send_errors += 1;
                tracing::warn!(error = %e, "failed to send OSC bundle");
            }
        }
    }

    fn poll_inbound(&mut self, now_ms: u64) -> usize {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let mut received = 0;
        while received < MAX_DATAGRAMS_PER_CYCLE {
            match self.sink.recv(&mut buf) {
                Ok(Some(n)) => {
                    received += 1;
                    self.handle_datagram(&buf[..n], now_ms);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "OSC receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
        received
    }

    /// Decode one datagram, drop self-echo and push the rest to the router.
    /// Returns the number of events forwarded.
    pub fn handle_datagram(&mut self, bytes: &[u8], now_ms: u64) -> usize {
        self.stats.datagrams_received += 1;
        match rosc::decoder::decode_udp(bytes) {
            Ok((_, packet)) => self.handle_packet(&packet, now_ms),
            Err(e) => {
                self.stats.decode_errors += 1;
                let error = BridgeError::OscDecode(e.to_string());
                tracing::debug!(%error, "ignoring datagram");
                0
            }
        }
    }

    fn handle_packet(&mut self, packet: &OscPacket, now_ms: u64) -> usize {
        match packet {
            OscPacket::Message(message) => self.handle_message(message, now_ms),
            OscPacket::Bundle(bundle) => bundle
                .content
                .iter()
                .map(|inner| self.handle_packet(inner, now_ms))
                .sum(),
        }
    }

    fn handle_message(&mut self, message: &OscMessage, now_ms: u64) -> usize {
        self.stats.messages_received += 1;
        let Some(event) = self.addresses.to_event(message) else {
            self.stats.unrecognized += 1;
            return 0;
        };
        if self.echo.is_echo(message, event.channel, now_ms) {
            self.stats.echoes_dropped += 1;
            return 0;
        }
        if self.inbound.push(event) {
            1
        } else {
            self.stats.inbound_dropped += 1;
            0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub burst_sleep: Duration,
    pub eco_sleep: Duration,
    pub idle_cycles_before_eco: u32,
}

impl From<&NetworkSettings> for Pacing {
    fn from(settings: &NetworkSettings) -> Self {
        Self {
            burst_sleep: Duration::from_millis(settings.burst_sleep_ms),
            eco_sleep: Duration::from_millis(settings.eco_sleep_ms),
            idle_cycles_before_eco: settings.idle_cycles_before_eco,
        }
    }
}

impl Pacing {
    pub fn sleep_for(&self, idle_cycles: u32) -> Duration {
        if idle_cycles >= self.idle_cycles_before_eco {
            self.eco_sleep
        } else {
            self.burst_sleep
        }
    }
}

/// The network worker thread. Parks between cycles; pushes to the outbound
/// lane wake it early.
pub struct NetworkBridge {
    outbound: Arc<Airlock<Event>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<WorkerStats>>,
}

impl NetworkBridge {
    pub fn spawn<S>(worker: BridgeWorker<S>, pacing: Pacing) -> Result<Self>
    where
        S: DatagramSink + 'static,
    {
        let outbound = worker.outbound.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("pulsebridge-net".into())
            .spawn(move || worker_loop(worker, pacing, thread_stop))?;

        let thread = handle.thread().clone();
        outbound.set_waker(Some(WakeFn::new(move || thread.unpark())));

        Ok(Self {
            outbound,
            stop,
            thread: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and join the worker. Returns its final counters.
    pub fn stop(&mut self) -> Option<WorkerStats> {
        let handle = self.thread.take()?;
        self.outbound.set_waker(None);
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        match handle.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                tracing::error!("network worker panicked");
                None
            }
        }
    }
}

impl Drop for NetworkBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<S: DatagramSink>(
    mut worker: BridgeWorker<S>,
    pacing: Pacing,
    stop: Arc<AtomicBool>,
) -> WorkerStats {
    tracing::info!("network worker started");
    let epoch = Instant::now();
    let mut idle_cycles: u32 = 0;

    while !stop.load(Ordering::Acquire) {
        let now_ms = epoch.elapsed().as_millis() as u64;
        if worker.run_cycle(now_ms) > 0 {
            idle_cycles = 0;
        } else {
            idle_cycles = idle_cycles.saturating_add(1);
        }
        thread::park_timeout(pacing.sleep_for(idle_cycles));
    }

    // Whatever is still queued goes out before we leave.
    let now_ms = epoch.elapsed().as_millis() as u64;
    worker.drain_outbound(now_ms);

    let stats = worker.stats();
    tracing::info!(?stats, "network worker stopped");
    stats
}
