// Conntrack event consumer.
//
// Orchestrates the netlink socket lifecycle: the initial per-namespace
// table dump, the streaming phase subscribed to new-connection events, and
// the throttling feedback loop that swaps the socket for a sampled one
// when the inbound rate exceeds the configured target.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;

use crate::breaker::CircuitBreaker;
use crate::error::CtError;
use crate::kernel;
use crate::netlink::conn::NetlinkConn;
use crate::netlink::socket::{NetlinkSocket, NetlinkTransport, RecvError};
use crate::netlink::{self, FramedMessage, NetlinkMessage, NlMsgHdr, OwnedMessage};
use crate::ns::{Namespaces, NsHandle, ProcNamespaces};
use crate::pool::BufferPool;
use crate::sampler;

/// Capacity of the output channel handed to consumers.
pub const OUTPUT_BUFFER: usize = 100;

/// Receive buffer requested for the streaming socket, large enough to ride
/// out bursts of conntrack events.
pub const NETLINK_BUFFER_SIZE: i32 = 1024 * 1024;

// Guards against under-sampling oscillation when recomputing the rate.
const OVERSHOOT_FACTOR: f64 = 0.95;

pub(crate) type TransportFactory =
    Box<dyn Fn(i32) -> Result<Arc<dyn NetlinkTransport>, CtError> + Send + Sync>;

/// One batch of framed conntrack messages delivered to a consumer.
///
/// The message payloads alias the pooled backing buffer; dropping the
/// event returns the buffer to the pool.
pub struct Event {
    msgs: Vec<FramedMessage>,
    netns: Option<i32>,
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Event {
    /// The framed messages of this batch, in kernel arrival order.
    pub fn messages(&self) -> impl Iterator<Item = NetlinkMessage<'_>> {
        let buf: &[u8] = self.buffer.as_deref().unwrap_or(&[]);
        self.msgs.iter().map(move |m| NetlinkMessage {
            header: m.header,
            data: &buf[m.payload.clone()],
        })
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Namespace the batch originated from, when cross-namespace listening
    /// is active.
    pub fn netns(&self) -> Option<i32> {
        self.netns
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.put(buf);
        }
    }
}

/// Telemetry snapshot; field names are the exported telemetry keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub enobufs: u64,
    pub throttles: u64,
    pub sampling_pct: i64,
    pub read_errors: u64,
    pub msg_errors: u64,
}

#[derive(Default)]
struct Counters {
    enobufs: AtomicU64,
    throttles: AtomicU64,
    sampling_pct: AtomicI64,
    read_errors: AtomicU64,
    msg_errors: AtomicU64,
}

/// Streams conntrack events from the kernel.
///
/// Construction performs no I/O; `events` and `dump_table` open sockets
/// and spawn the receive worker.
pub struct Consumer {
    inner: Arc<Inner>,
}

struct Inner {
    target_rate_limit: i64,
    listen_all_namespaces: bool,
    pre_315_kernel: bool,
    namespaces: Arc<dyn Namespaces>,
    factory: TransportFactory,
    pool: Arc<BufferPool>,
    breaker: Mutex<CircuitBreaker>,
    // Current socket. Written by the receive worker (throttle replacement)
    // and by initialization; stop() only closes.
    transport: Mutex<Option<Arc<dyn NetlinkTransport>>>,
    sampling_rate: Mutex<f64>,
    seq: AtomicU32,
    streaming: AtomicBool,
    stopped: AtomicBool,
    recv_loop_running: AtomicBool,
    counters: Counters,
}

impl Consumer {
    /// Create a consumer reading namespaces under `proc_root`, throttling
    /// toward `target_rate_limit` messages per second (-1 disables), and
    /// optionally listening across all network namespaces.
    pub fn new(
        proc_root: impl Into<std::path::PathBuf>,
        target_rate_limit: i64,
        listen_all_namespaces: bool,
    ) -> Self {
        Self::assemble(
            Arc::new(ProcNamespaces::new(proc_root)),
            Box::new(|protocol| {
                let socket = NetlinkSocket::open(protocol)?;
                Ok(Arc::new(socket) as Arc<dyn NetlinkTransport>)
            }),
            target_rate_limit,
            listen_all_namespaces,
            kernel::pre_315(),
            CircuitBreaker::new(target_rate_limit),
        )
    }

    fn assemble(
        namespaces: Arc<dyn Namespaces>,
        factory: TransportFactory,
        target_rate_limit: i64,
        listen_all_namespaces: bool,
        pre_315_kernel: bool,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                target_rate_limit,
                listen_all_namespaces,
                pre_315_kernel,
                namespaces,
                factory,
                pool: Arc::new(BufferPool::new()),
                breaker: Mutex::new(breaker),
                transport: Mutex::new(None),
                sampling_rate: Mutex::new(1.0),
                seq: AtomicU32::new(1),
                streaming: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                recv_loop_running: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Start streaming new-connection events.
    ///
    /// Initialization errors are returned synchronously; later failures
    /// are signalled only by channel closure.
    pub fn events(&self) -> Result<Receiver<Event>, CtError> {
        self.inner.init_netlink_socket(1.0)?;

        let (tx, rx) = bounded(OUTPUT_BUFFER);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("ctstream-recv".into())
            .spawn(move || {
                inner.streaming.store(true, Ordering::Release);
                if let Some(t) = inner.current_transport() {
                    let _ = t.join_group(netlink::CONNTRACK_NEW_GROUP);
                }
                inner.receive(&tx);
                log::info!("exited conntrack netlink receive loop");
            })
            .map_err(|e| CtError::Fatal(format!("spawn receive thread: {e}")))?;

        Ok(rx)
    }

    /// Dump the current conntrack table, namespace by namespace, for the
    /// given address family. The channel closes once every namespace has
    /// been drained; per-namespace failures are logged and skipped.
    pub fn dump_table(&self, family: u8) -> Result<Receiver<Event>, CtError> {
        let namespaces = if self.inner.listen_all_namespaces {
            self.inner.namespaces.list()?
        } else {
            Vec::new()
        };
        let root = self.inner.namespaces.root()?;

        // Control connection for namespace-id queries, opened in the root
        // namespace on the route protocol.
        let mut control_transport = None;
        self.inner.namespaces.enter(&root, &mut || {
            control_transport = Some((self.inner.factory)(libc::NETLINK_ROUTE)?);
            Ok(())
        })?;
        let control = NetlinkConn::new(
            control_transport.ok_or_else(|| CtError::Fatal("control socket not created".into()))?,
        );

        let (tx, rx) = bounded(OUTPUT_BUFFER);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("ctstream-dump".into())
            .spawn(move || {
                if let Err(e) = inner.dump_ns(family, &tx, &root) {
                    log::warn!(
                        "error dumping conntrack table for root namespace, \
                         some translation info may be missing: {e}"
                    );
                }

                for ns in &namespaces {
                    if ns.same_ns(&root) {
                        continue;
                    }
                    if !inner.is_peer_ns(&control, ns) {
                        continue;
                    }
                    if let Err(e) = inner.dump_ns(family, &tx, ns) {
                        log::warn!("error dumping conntrack table for a namespace: {e}");
                    }
                }

                control.close();
            })
            .map_err(|e| CtError::Fatal(format!("spawn dump thread: {e}")))?;

        Ok(rx)
    }

    /// Atomic snapshot of the telemetry counters.
    pub fn stats(&self) -> Stats {
        let c = &self.inner.counters;
        Stats {
            enobufs: c.enobufs.load(Ordering::Relaxed),
            throttles: c.throttles.load(Ordering::Relaxed),
            sampling_pct: c.sampling_pct.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            msg_errors: c.msg_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the consumer. The worker observes the closed socket, exits,
    /// and closes the output channel. Irreversible.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(t) = self.inner.current_transport() {
            t.close();
        }
        self.inner.breaker.lock().unwrap().stop();
    }
}

impl Inner {
    fn current_transport(&self) -> Option<Arc<dyn NetlinkTransport>> {
        self.transport.lock().unwrap().clone()
    }

    fn set_transport(&self, t: Arc<dyn NetlinkTransport>) {
        *self.transport.lock().unwrap() = Some(t);
    }

    /// Open and configure the streaming socket at the given sampling rate.
    fn init_netlink_socket(&self, sampling_rate: f64) -> Result<(), CtError> {
        let root = self.namespaces.root()?;
        let mut created = None;
        self.namespaces.enter(&root, &mut || {
            created = Some((self.factory)(libc::NETLINK_NETFILTER)?);
            Ok(())
        })?;
        let transport =
            created.ok_or_else(|| CtError::Fatal("netlink socket not created".into()))?;

        // Forced enlargement can exceed the rmem_default cap but needs
        // CAP_NET_ADMIN; treat failure as degraded, not fatal.
        if let Err(e) =
            transport.set_sockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUFFORCE, NETLINK_BUFFER_SIZE)
        {
            log::warn!("error setting receive buffer size for netlink socket: {e}");
        }
        if let Ok(size) = transport.recv_buffer_size() {
            log::debug!("netlink socket receive buffer is {size} bytes");
        }

        if self.listen_all_namespaces {
            if let Err(e) =
                transport.set_sockopt_int(libc::SOL_NETLINK, libc::NETLINK_LISTEN_ALL_NSID, 1)
            {
                log::warn!("error enabling listen for all namespaces on netlink socket: {e}");
            }
        }

        *self.sampling_rate.lock().unwrap() = sampling_rate;
        self.counters
            .sampling_pct
            .store((sampling_rate * 100.0) as i64, Ordering::Relaxed);

        if sampling_rate >= 1.0 {
            self.set_transport(transport);
            return Ok(());
        }

        log::info!("attaching netlink BPF filter with sampling rate {sampling_rate:.2}");
        let prog = sampler::generate(sampling_rate)?;
        if let Err(e) = transport.attach_filter(&prog) {
            self.counters.sampling_pct.store(0, Ordering::Relaxed);
            return Err(CtError::FilterAttach(e));
        }
        self.set_transport(transport);
        Ok(())
    }

    /// Dump one namespace: enter it, open a fresh socket, issue the table
    /// get request, and drain the multi-part reply into `output`.
    fn dump_ns(&self, family: u8, output: &Sender<Event>, ns: &NsHandle) -> Result<(), CtError> {
        self.namespaces.enter(ns, &mut || {
            let transport = (self.factory)(libc::NETLINK_NETFILTER)?;
            let conn = NetlinkConn::new(Arc::clone(&transport));

            let request = OwnedMessage {
                header: NlMsgHdr {
                    ty: netlink::CTNETLINK_GET,
                    flags: netlink::NLM_F_REQUEST | netlink::NLM_F_DUMP,
                    ..Default::default()
                },
                data: vec![family, netlink::NFNETLINK_V0, 0, 0],
            };

            let sent = match conn.send(request.clone()) {
                Ok(m) => m,
                Err(e) => {
                    conn.close();
                    return Err(e);
                }
            };
            if let Err(e) = netlink::validate(&request.header, std::slice::from_ref(&sent)) {
                conn.close();
                return Err(e);
            }

            self.set_transport(transport);
            self.receive(output);
            conn.close();
            Ok(())
        })
    }

    /// Determine whether `ns` is a peer of the control socket's namespace
    /// by querying its namespace id. Failures are conservative: not a
    /// peer.
    fn is_peer_ns(&self, control: &NetlinkConn, ns: &NsHandle) -> bool {
        let mut data = vec![libc::AF_UNSPEC as u8, 0, 0, 0];
        let mut attrs = netlink::AttributeEncoder::new();
        attrs.u32(netlink::NETNSA_FD, ns.as_raw_fd() as u32);
        data.extend_from_slice(&attrs.finish());

        let request = OwnedMessage {
            header: NlMsgHdr {
                ty: libc::RTM_GETNSID,
                flags: netlink::NLM_F_REQUEST,
                seq: self.seq.load(Ordering::Relaxed),
                ..Default::default()
            },
            data,
        };

        if let Err(e) = control.send(request) {
            log::warn!("error sending namespace id query: {e}");
            return false;
        }

        let replies = match control.receive() {
            Ok(msgs) if !msgs.is_empty() => msgs,
            Ok(_) => return false,
            Err(e) => {
                log::warn!("error receiving namespace id reply: {e}");
                return false;
            }
        };

        if replies[0].header.ty == netlink::NLMSG_ERROR {
            return false;
        }
        self.seq.fetch_add(1, Ordering::Relaxed);

        // Skip the rtgenmsg header preceding the attributes.
        let Some(payload) = replies[0].data.get(4..) else {
            return false;
        };
        for (ty, value) in netlink::attributes(payload) {
            if ty == netlink::NETNSA_NSID && value.len() >= 4 {
                let nsid = i32::from_ne_bytes([value[0], value[1], value[2], value[3]]);
                return nsid >= 0;
            }
        }
        false
    }

    /// The receive loop, shared by the dump and streaming phases.
    ///
    /// During a dump (`streaming` false) the loop returns once the
    /// multi-part Done sentinel has been delivered; when streaming it runs
    /// until the socket closes or throttling fails terminally.
    fn receive(&self, output: &Sender<Event>) {
        let _running = LoopGuard::enter(&self.recv_loop_running);

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let Some(transport) = self.current_transport() else {
                return;
            };

            let mut buf = self.pool.get();
            let batch = transport.receive_into(&mut buf);
            let mut msgs = batch.messages;

            if let Some(err) = batch.error {
                match err {
                    RecvError::Closed => {
                        self.pool.put(buf);
                        return;
                    }
                    RecvError::WouldBlock => {
                        // Idle poll tick; nothing to deliver or count.
                        if msgs.is_empty() {
                            self.pool.put(buf);
                            continue;
                        }
                    }
                    RecvError::NoBufferSpace => {
                        self.counters.enobufs.fetch_add(1, Ordering::Relaxed);
                    }
                    RecvError::Other(e) => {
                        self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                        log::debug!("netlink read error: {e}");
                    }
                }
            }

            if let Err(e) = self.throttle(msgs.len()) {
                log::warn!("exiting conntrack receive loop due to throttling error: {e}");
                self.pool.put(buf);
                return;
            }

            // A batch containing an invalid message is dropped whole so
            // downstream decoders only ever see well-formed batches.
            if let Some(err) = msgs
                .iter()
                .find_map(|m| netlink::check_message(&m.header, &buf[m.payload.clone()]).err())
            {
                self.counters.msg_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping batch with invalid message: {err}");
                self.pool.put(buf);
                continue;
            }

            // Strip the multi-part terminator.
            let multi_part_done = msgs
                .last()
                .is_some_and(|m| m.header.ty == netlink::NLMSG_DONE);
            if multi_part_done {
                msgs.pop();
            }

            let event = Event {
                msgs,
                netns: batch.netns,
                buffer: Some(buf),
                pool: Arc::clone(&self.pool),
            };
            if output.send(event).is_err() {
                // Receiver dropped; nobody is listening anymore.
                return;
            }

            if multi_part_done && !self.streaming.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Keep the read throughput below the target rate. When the breaker
    /// trips, swap the socket for one sampled down toward the target.
    fn throttle(&self, messages: usize) -> Result<(), CtError> {
        // The kernel dictates the pace of a dump; only streaming is
        // throttled.
        if !self.streaming.load(Ordering::Acquire) {
            return Ok(());
        }

        let observed = {
            let mut breaker = self.breaker.lock().unwrap();
            breaker.tick(messages);
            if !breaker.is_open() {
                return Ok(());
            }
            breaker.rate()
        };
        self.counters.throttles.fetch_add(1, Ordering::Relaxed);

        if self.pre_315_kernel {
            log::warn!(
                "conntrack sampling requires kernel 3.15+; continuing unsampled. \
                 Consider raising the configured rate limit (currently {}) to match \
                 the observed conntrack update rate",
                self.target_rate_limit
            );
            self.breaker.lock().unwrap().reset();
            return Ok(());
        }

        if let Some(t) = self.transport.lock().unwrap().take() {
            t.close();
        }

        let current = *self.sampling_rate.lock().unwrap();
        let sampling_rate = next_sampling_rate(self.target_rate_limit as f64, observed, current);
        self.init_netlink_socket(sampling_rate).map_err(|e| {
            log::warn!("failed to re-create netlink socket: {e}");
            e
        })?;

        self.breaker.lock().unwrap().reset();

        let transport = self
            .current_transport()
            .ok_or_else(|| CtError::Fatal("netlink socket missing after reinit".into()))?;
        transport
            .join_group(netlink::CONNTRACK_NEW_GROUP)
            .map_err(CtError::Socket)
    }
}

/// Sampling rate that brings `observed` messages per second down to
/// `target`, shaded by the overshoot factor.
fn next_sampling_rate(target: f64, observed: f64, current: f64) -> f64 {
    (target / observed) * current * OVERSHOOT_FACTOR
}

/// Marks the receive loop as running for its whole extent, panics
/// included.
struct LoopGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> LoopGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let was_running = flag.swap(true, Ordering::SeqCst);
        debug_assert!(!was_running, "second receive loop started");
        Self { flag }
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
