use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use zmux_frame::{FrameKind, FrameReader, Header};
use zmux_transport::{Duplex, TransportError};

use crate::channel::{Channel, ChannelCore};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result, Termination};
use crate::lifecycle::Lifecycle;
use crate::ring::{lock, BufferError, RingBuffer};

/// Which side of the channel handshake an endpoint plays.
///
/// Fixed by the first call to `open` or `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends OPEN and waits for ACCEPTED.
    Initiator,
    /// Answers OPEN with ACCEPTED and assigns channel ids.
    Acceptor,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Acceptor => "acceptor",
        }
    }
}

/// Progress of the single in-flight OPEN on the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Idle,
    /// OPEN received; waiting for a caller of `accept`.
    Requested,
    /// An `accept` caller took it and is registering the channel.
    Claimed,
    /// Channel registered and ACCEPTED queued; the receive loop may go on.
    Registered,
}

struct PendingOpen {
    ticket: u64,
    recv_buffer_size: usize,
}

struct Control {
    handoff: Handoff,
    /// OPENs we sent, oldest first. ACCEPTED frames answer them in order.
    pending_opens: VecDeque<PendingOpen>,
    delivered: HashMap<u64, Arc<ChannelCore>>,
    /// Tickets whose `open` caller gave up waiting.
    abandoned: HashSet<u64>,
}

/// State shared by the [`Mux`] handle, its channels and both loops.
pub(crate) struct Shared {
    config: MuxConfig,
    send: RingBuffer,
    channels: RwLock<HashMap<u16, Arc<ChannelCore>>>,
    control: Mutex<Control>,
    control_changed: Condvar,
    /// Keeps OPEN frames in the same order as `pending_opens`.
    open_order: Mutex<()>,
    next_ticket: AtomicU64,
    next_id: AtomicU16,
    role: OnceLock<Role>,
    lifecycle: Lifecycle,
}

impl Shared {
    fn new(config: MuxConfig) -> Self {
        Self {
            send: RingBuffer::new(config.send_buffer_size),
            config,
            channels: RwLock::new(HashMap::new()),
            control: Mutex::new(Control {
                handoff: Handoff::Idle,
                pending_opens: VecDeque::new(),
                delivered: HashMap::new(),
                abandoned: HashSet::new(),
            }),
            control_changed: Condvar::new(),
            open_order: Mutex::new(()),
            next_ticket: AtomicU64::new(0),
            next_id: AtomicU16::new(0),
            role: OnceLock::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn send_buffer(&self) -> &RingBuffer {
        &self.send
    }

    pub(crate) fn termination(&self) -> Option<Termination> {
        self.lifecycle.termination()
    }

    /// Error reported to callers once the multiplexer has stopped.
    pub(crate) fn terminal_error(&self) -> MuxError {
        MuxError::Terminated(self.termination().unwrap_or(Termination::Closed))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.termination() {
            Some(cause) => Err(MuxError::Terminated(cause)),
            None => Ok(()),
        }
    }

    /// Queue a header-only frame on the send buffer.
    pub(crate) fn enqueue_control(&self, header: Header) -> Result<()> {
        self.send
            .write(&header.to_bytes())
            .map_err(|_| self.terminal_error())?;
        trace!(kind = header.kind.name(), channel = header.channel, "control frame queued");
        Ok(())
    }

    fn channels(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u16, Arc<ChannelCore>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u16, Arc<ChannelCore>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: u16) -> Option<Arc<ChannelCore>> {
        self.channels().get(&id).cloned()
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        if self.channels_mut().remove(&id).is_some() {
            debug!(channel = id, "channel released");
        }
    }

    fn claim_role(&self, wanted: Role) -> Result<()> {
        let role = *self.role.get_or_init(|| wanted);
        if role != wanted {
            return Err(MuxError::RoleConflict {
                role: role.name(),
                attempted: match wanted {
                    Role::Initiator => "open a channel",
                    Role::Acceptor => "accept a channel",
                },
            });
        }
        Ok(())
    }

    fn wait_control<'a>(
        &self,
        control: MutexGuard<'a, Control>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, Control> {
        match deadline {
            None => self
                .control_changed
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner),
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                self.control_changed
                    .wait_timeout(control, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }

    /// Stop the multiplexer. Only the first cause is kept.
    ///
    /// Closing every buffer wakes all blocked callers: channel readers see
    /// end-of-data, writers and the send loop see a closed buffer.
    fn terminate(&self, cause: Termination) {
        if !self.lifecycle.terminate(cause.clone()) {
            return;
        }
        if cause.is_failure() {
            warn!(cause = %cause, "multiplexer terminated");
        } else {
            debug!(cause = %cause, "multiplexer terminated");
        }

        self.send.close();
        for core in self.channels().values() {
            core.recv.close();
        }
        {
            let mut control = lock(&self.control);
            control.pending_opens.clear();
            control.abandoned.clear();
        }
        self.control_changed.notify_all();
    }

    fn allocate_id(&self, channels: &HashMap<u16, Arc<ChannelCore>>) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MuxError::ChannelIdsExhausted)
    }

    /// Register a fresh channel and queue its ACCEPTED frame.
    fn register_accepted(&self, recv_buffer_size: usize) -> Result<Arc<ChannelCore>> {
        let core = {
            let mut channels = self.channels_mut();
            let id = self.allocate_id(&channels)?;
            let core = Arc::new(ChannelCore::new(id, recv_buffer_size));
            channels.insert(id, Arc::clone(&core));
            core
        };
        if let Err(err) = self.enqueue_control(Header::accepted(core.id)) {
            self.remove_channel(core.id);
            return Err(err);
        }
        Ok(core)
    }

    fn on_open(&self) -> std::result::Result<(), Termination> {
        // A peer OPEN makes this side the acceptor; an initiator would never
        // answer it.
        if *self.role.get_or_init(|| Role::Acceptor) == Role::Initiator {
            return Err(Termination::Protocol(
                "OPEN received by the initiating side".to_string(),
            ));
        }
        let mut control = lock(&self.control);
        control.handoff = Handoff::Requested;
        self.control_changed.notify_all();
        while control.handoff != Handoff::Registered {
            if let Some(cause) = self.termination() {
                return Err(cause);
            }
            control = self.wait_control(control, None);
        }
        control.handoff = Handoff::Idle;
        Ok(())
    }

    fn on_accepted(&self, id: u16) -> std::result::Result<(), Termination> {
        let pending = lock(&self.control)
            .pending_opens
            .pop_front()
            .ok_or_else(|| Termination::Protocol(format!("ACCEPTED {id} without a pending OPEN")))?;

        let core = Arc::new(ChannelCore::new(id, pending.recv_buffer_size));
        {
            let mut channels = self.channels_mut();
            if channels.contains_key(&id) {
                return Err(Termination::Protocol(format!(
                    "ACCEPTED {id} for a channel that is still open"
                )));
            }
            channels.insert(id, Arc::clone(&core));
        }

        let abandoned = {
            let mut control = lock(&self.control);
            let abandoned = control.abandoned.remove(&pending.ticket);
            if !abandoned {
                control.delivered.insert(pending.ticket, Arc::clone(&core));
            }
            abandoned
        };
        self.control_changed.notify_all();

        if abandoned {
            debug!(channel = id, "open was abandoned; closing channel");
            // Failure here means the mux is already stopping.
            let _ = core.close(self);
        }
        Ok(())
    }

    fn on_payload<R: Read>(
        &self,
        header: Header,
        frames: &mut FrameReader<R>,
    ) -> std::result::Result<(), Termination> {
        let core = self.lookup(header.channel).ok_or_else(|| {
            Termination::Protocol(format!("PAYLOAD for unknown channel {}", header.channel))
        })?;

        if core.is_locally_closed() {
            return frames
                .skip_payload(header.payload_len)
                .map_err(|err| Termination::from(&err));
        }

        let mut payload = frames.payload(header.payload_len);
        match core.recv.fill_from(&mut payload) {
            Ok(_) | Err(BufferError::Closed) => {}
            Err(BufferError::Io(err)) => return Err(Termination::Transport(err.to_string())),
        }
        // Bytes the channel no longer wants still have to leave the stream.
        io::copy(&mut payload, &mut io::sink())
            .map_err(|err| Termination::Transport(err.to_string()))?;
        if payload.limit() != 0 {
            return Err(Termination::TransportClosed);
        }
        Ok(())
    }

    fn on_close(&self, id: u16) -> std::result::Result<(), Termination> {
        let core = self
            .lookup(id)
            .ok_or_else(|| Termination::Protocol(format!("CLOSE for unknown channel {id}")))?;
        if core.mark_remote_closed() {
            self.remove_channel(id);
        }
        debug!(channel = id, "channel closed by peer");
        Ok(())
    }

    fn recv_frame<R: Read>(
        &self,
        frames: &mut FrameReader<R>,
    ) -> std::result::Result<(), Termination> {
        let header = frames.read_header().map_err(|err| Termination::from(&err))?;
        trace!(
            kind = header.kind.name(),
            channel = header.channel,
            len = header.payload_len,
            "frame received"
        );
        match header.kind {
            FrameKind::Open => self.on_open(),
            FrameKind::Accepted => self.on_accepted(header.channel),
            FrameKind::Payload => self.on_payload(header, frames),
            FrameKind::Close => self.on_close(header.channel),
        }
    }
}

fn recv_loop<R: Read>(shared: Arc<Shared>, reader: R) {
    let mut frames = FrameReader::with_config(reader, shared.config.frame_config());
    debug!("receive loop started");
    let cause = loop {
        if let Some(cause) = shared.termination() {
            break cause;
        }
        if let Err(cause) = shared.recv_frame(&mut frames) {
            break cause;
        }
    };
    shared.terminate(cause);
    debug!("receive loop stopped");
}

fn send_loop<W: Write>(shared: Arc<Shared>, mut writer: W) {
    debug!("send loop started");
    loop {
        let result = shared
            .send
            .drain_to(&mut writer)
            .map_err(|err| err.to_string())
            .and_then(|n| writer.flush().map(|()| n).map_err(|err| err.to_string()));
        match result {
            Ok(0) => break,
            Ok(n) => trace!(bytes = n, "sent"),
            Err(err) => {
                shared.terminate(Termination::Transport(err));
                break;
            }
        }
    }
    debug!("send loop stopped");
}

fn spawn_loop<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|err| MuxError::Transport(TransportError::Io(err)))
}

/// Multiplexes many [`Channel`]s over one duplex byte stream.
///
/// Two background threads move bytes: `zmux-recv` reads frames from the
/// transport and routes them, `zmux-send` drains the shared send buffer into
/// the transport. Each endpoint either opens channels or accepts them,
/// whichever it does first.
///
/// Dropping the `Mux` terminates it, like [`close`](Self::close). The
/// receive thread exits once the transport read returns.
pub struct Mux {
    shared: Arc<Shared>,
    _recv_loop: JoinHandle<()>,
    send_loop: Option<JoinHandle<()>>,
}

impl Mux {
    /// Start multiplexing over `transport` with default settings.
    pub fn new<T: Duplex>(transport: T) -> Result<Self> {
        Self::with_config(transport, MuxConfig::default())
    }

    /// Start multiplexing over `transport`.
    pub fn with_config<T: Duplex>(transport: T, config: MuxConfig) -> Result<Self> {
        let config = config.normalized();
        let (reader, writer) = transport.split()?;
        let shared = Arc::new(Shared::new(config));

        let recv = {
            let shared = Arc::clone(&shared);
            spawn_loop("zmux-recv", move || recv_loop(shared, reader))?
        };
        let send = {
            let shared = Arc::clone(&shared);
            spawn_loop("zmux-send", move || send_loop(shared, writer))
        };
        let send = match send {
            Ok(handle) => handle,
            Err(err) => {
                shared.terminate(Termination::Closed);
                return Err(err);
            }
        };

        debug!(
            send_buffer = shared.config.send_buffer_size,
            recv_buffer = shared.config.recv_buffer_size,
            "multiplexer started"
        );
        Ok(Self {
            shared,
            _recv_loop: recv,
            send_loop: Some(send),
        })
    }

    /// Open a channel with the default receive buffer size.
    pub fn open(&self) -> Result<Channel> {
        self.open_with_size(0)
    }

    /// Ask the peer for a new channel and wait for its ACCEPTED.
    ///
    /// `recv_buffer_size` of zero uses the configured default. Concurrent
    /// calls are answered in the order their OPEN frames were sent.
    pub fn open_with_size(&self, recv_buffer_size: usize) -> Result<Channel> {
        let shared = &self.shared;
        shared.claim_role(Role::Initiator)?;
        let recv_buffer_size = shared.config.recv_buffer_or_default(recv_buffer_size);
        let ticket = shared.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let _order = lock(&shared.open_order);
            {
                let mut control = lock(&shared.control);
                shared.ensure_running()?;
                control.pending_opens.push_back(PendingOpen {
                    ticket,
                    recv_buffer_size,
                });
            }
            shared.enqueue_control(Header::open())?;
        }

        let timeout = shared.config.handshake_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut control = lock(&shared.control);
        let core = loop {
            if let Some(core) = control.delivered.remove(&ticket) {
                break core;
            }
            shared.ensure_running()?;
            if let (Some(timeout), Some(at)) = (timeout, deadline) {
                if Instant::now() >= at {
                    control.abandoned.insert(ticket);
                    return Err(MuxError::Timeout(timeout));
                }
            }
            control = shared.wait_control(control, deadline);
        };
        drop(control);

        debug!(channel = core.id, "channel opened");
        Ok(Channel::new(core, Arc::clone(shared)))
    }

    /// Accept a channel with the default receive buffer size.
    pub fn accept(&self) -> Result<Channel> {
        self.accept_with_size(0)
    }

    /// Wait for the peer's next OPEN and answer it.
    ///
    /// The channel is registered before ACCEPTED is queued, so the first
    /// PAYLOAD the peer sends already has somewhere to go.
    pub fn accept_with_size(&self, recv_buffer_size: usize) -> Result<Channel> {
        let shared = &self.shared;
        shared.claim_role(Role::Acceptor)?;
        let recv_buffer_size = shared.config.recv_buffer_or_default(recv_buffer_size);

        let timeout = shared.config.handshake_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut control = lock(&shared.control);
            loop {
                shared.ensure_running()?;
                if control.handoff == Handoff::Requested {
                    break;
                }
                if let (Some(timeout), Some(at)) = (timeout, deadline) {
                    if Instant::now() >= at {
                        return Err(MuxError::Timeout(timeout));
                    }
                }
                control = shared.wait_control(control, deadline);
            }
            control.handoff = Handoff::Claimed;
        }

        let registered = shared.register_accepted(recv_buffer_size);
        lock(&shared.control).handoff = Handoff::Registered;
        shared.control_changed.notify_all();

        let core = registered?;
        debug!(channel = core.id, "channel accepted");
        Ok(Channel::new(core, Arc::clone(shared)))
    }

    /// Stop the multiplexer.
    ///
    /// Blocked channel operations and `open`/`accept` calls fail with
    /// [`MuxError::Terminated`]. Frames already queued are still handed to the
    /// transport. Idempotent.
    pub fn close(&self) {
        self.shared.terminate(Termination::Closed);
    }

    /// Close the multiplexer and wait until everything already queued has
    /// been handed to the transport.
    ///
    /// Returns the termination cause, which is `Closed` unless the
    /// multiplexer had already failed.
    pub fn shutdown(mut self) -> Option<Termination> {
        self.shared.terminate(Termination::Closed);
        if let Some(send_loop) = self.send_loop.take() {
            if send_loop.join().is_err() {
                warn!("send loop panicked");
            }
        }
        self.termination()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lifecycle.is_terminated()
    }

    /// Why the multiplexer stopped, if it has.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination()
    }

    /// Block until the multiplexer stops or `timeout` elapses.
    pub fn wait_terminated(&self, timeout: Option<Duration>) -> Option<Termination> {
        self.shared.lifecycle.wait(timeout)
    }

    /// Number of channels not yet closed by both sides.
    pub fn channel_count(&self) -> usize {
        self.shared.channels().len()
    }

    /// The role fixed by the first `open` or `accept`, if any.
    pub fn role(&self) -> Option<Role> {
        self.shared.role.get().copied()
    }

    /// Effective configuration, after defaults were applied.
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared.terminate(Termination::Closed);
    }
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("role", &self.role())
            .field("channels", &self.channel_count())
            .field("termination", &self.termination())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::{mpsc, Barrier};

    use zmux_frame::{FrameWriter, HEADER_SIZE};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn mux_pair(config: MuxConfig) -> (Mux, Mux) {
        let (left, right) = UnixStream::pair().unwrap();
        (
            Mux::with_config(left, config.clone()).unwrap(),
            Mux::with_config(right, config).unwrap(),
        )
    }

    /// A mux on one end and raw frame access on the other.
    fn mux_and_raw(config: MuxConfig) -> (Mux, FrameReader<UnixStream>, FrameWriter<UnixStream>) {
        let (left, right) = UnixStream::pair().unwrap();
        let reader = FrameReader::new(right.try_clone().unwrap());
        let writer = FrameWriter::new(right);
        (Mux::with_config(left, config).unwrap(), reader, writer)
    }

    fn open_accept(client: &Mux, server: &Mux) -> (Channel, Channel) {
        thread::scope(|s| {
            let accepted = s.spawn(|| server.accept().unwrap());
            let opened = client.open().unwrap();
            (opened, accepted.join().unwrap())
        })
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn read_to_end(channel: &Channel) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = channel;
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn open_and_accept_agree_on_id() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (opened, accepted) = open_accept(&client, &server);

        assert_eq!(opened.id(), 0);
        assert_eq!(opened.id(), accepted.id());
        assert_eq!(client.role(), Some(Role::Initiator));
        assert_eq!(server.role(), Some(Role::Acceptor));
        assert_eq!(client.channel_count(), 1);
        assert_eq!(server.channel_count(), 1);
    }

    #[test]
    fn small_reads_reassemble_payload() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (opened, accepted) = open_accept(&client, &server);

        opened.write(b"ping").unwrap();

        let mut got = Vec::new();
        let mut byte = [0u8; 1];
        while got.len() < 4 {
            let n = accepted.read(&mut byte).unwrap();
            got.extend_from_slice(&byte[..n]);
        }
        assert_eq!(got, b"ping");
    }

    #[test]
    fn channels_do_not_mix() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (a_client, a_server) = open_accept(&client, &server);
        let (b_client, b_server) = open_accept(&client, &server);
        assert_ne!(a_client.id(), b_client.id());

        a_client.write(b"A1").unwrap();
        b_client.write(b"B1").unwrap();
        a_client.write(b"A2").unwrap();
        b_server.write(b"reply-b").unwrap();
        a_client.close().unwrap();
        b_client.close().unwrap();

        assert_eq!(read_to_end(&a_server), b"A1A2");
        assert_eq!(read_to_end(&b_server), b"B1");

        let mut reply = [0u8; 7];
        assert!(matches!(
            (&b_client).read_exact(&mut reply),
            Err(err) if err.kind() == ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn large_transfer_respects_small_buffers() {
        let config = MuxConfig {
            send_buffer_size: 64,
            recv_buffer_size: 16,
            ..MuxConfig::default()
        };
        let (client, server) = mux_pair(config);
        let (opened, accepted) = open_accept(&client, &server);

        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let received = thread::scope(|s| {
            let reader = s.spawn(|| read_to_end(&accepted));
            for chunk in data.chunks(1000) {
                opened.write(chunk).unwrap();
            }
            opened.close().unwrap();
            reader.join().unwrap()
        });
        assert_eq!(received, data);
    }

    #[test]
    fn head_of_line_clears_once_reader_drains() {
        let config = MuxConfig {
            recv_buffer_size: 8,
            ..MuxConfig::default()
        };
        let (client, server) = mux_pair(config);
        let (slow_client, slow_server) = open_accept(&client, &server);
        let (fast_client, fast_server) = open_accept(&client, &server);

        // The slow channel's frame stalls the receive loop until it is read.
        slow_client.write(&[1u8; 32]).unwrap();
        fast_client.write(b"fast").unwrap();

        let mut slow = [0u8; 32];
        (&slow_server).read_exact(&mut slow).unwrap();
        let mut fast = [0u8; 4];
        (&fast_server).read_exact(&mut fast).unwrap();
        assert_eq!(&fast, b"fast");
    }

    #[test]
    fn concurrent_opens_pair_up() {
        const N: usize = 8;
        let (client, server) = mux_pair(MuxConfig::default());
        let barrier = Barrier::new(N);

        thread::scope(|s| {
            let acceptor = s.spawn(|| {
                let mut by_id = HashMap::new();
                for _ in 0..N {
                    let channel = server.accept().unwrap();
                    by_id.insert(channel.id(), channel);
                }
                by_id
            });

            let openers: Vec<_> = (0..N)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let channel = client.open().unwrap();
                        channel.write(&channel.id().to_le_bytes()).unwrap();
                        channel
                    })
                })
                .collect();
            let opened: Vec<Channel> = openers.into_iter().map(|h| h.join().unwrap()).collect();
            let accepted = acceptor.join().unwrap();

            assert_eq!(accepted.len(), N);
            for channel in &opened {
                let mut peer: &Channel = &accepted[&channel.id()];
                let mut id = [0u8; 2];
                peer.read_exact(&mut id).unwrap();
                assert_eq!(u16::from_le_bytes(id), channel.id());
            }
        });
    }

    #[test]
    fn close_gives_peer_eof_and_releases_ids() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (opened, accepted) = open_accept(&client, &server);

        opened.write(b"last words").unwrap();
        opened.close().unwrap();
        opened.close().unwrap();
        assert!(matches!(opened.write(b"x"), Err(MuxError::ChannelClosed(0))));
        assert!(matches!(opened.read(&mut [0u8; 4]), Err(MuxError::ChannelClosed(0))));

        assert_eq!(read_to_end(&accepted), b"last words");
        assert!(matches!(accepted.write(b"late"), Err(MuxError::ChannelClosed(0))));
        drop(accepted);

        assert!(eventually(|| client.channel_count() == 0));
        assert!(eventually(|| server.channel_count() == 0));
    }

    #[test]
    fn payload_is_routed_before_open_returns() {
        let (mux, mut reader, mut writer) = mux_and_raw(MuxConfig::default());

        let peer = thread::spawn(move || {
            assert_eq!(reader.read_header().unwrap(), Header::open());
            writer.accepted(77).unwrap();
            writer.send(77, b"eager").unwrap();
            (reader, writer)
        });

        let channel = mux.open().unwrap();
        assert_eq!(channel.id(), 77);
        let mut buf = [0u8; 5];
        (&channel).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"eager");
        let _peer = peer.join().unwrap();
    }

    #[test]
    fn channel_writes_are_framed() {
        let (mux, mut reader, mut writer) = mux_and_raw(MuxConfig::default());

        writer.open().unwrap();
        let channel = mux.accept().unwrap();
        assert_eq!(reader.read_header().unwrap(), Header::accepted(channel.id()));

        channel.write(b"hello").unwrap();
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.header.kind, FrameKind::Payload);
        assert_eq!(frame.header.channel, channel.id());
        assert_eq!(frame.payload.as_ref(), b"hello");

        drop(channel);
        assert_eq!(reader.read_header().unwrap().kind, FrameKind::Close);
    }

    #[test]
    fn oversized_write_is_rejected_locally() {
        let config = MuxConfig {
            max_payload_size: 8,
            ..MuxConfig::default()
        };
        let (client, server) = mux_pair(config);
        let (opened, _accepted) = open_accept(&client, &server);

        assert!(matches!(
            opened.write(&[0u8; 9]),
            Err(MuxError::Frame(zmux_frame::FrameError::PayloadTooLarge { size: 9, max: 8 }))
        ));
        assert!(!client.is_terminated());
    }

    #[test]
    fn accept_times_out_without_open() {
        let config = MuxConfig {
            handshake_timeout_ms: Some(50),
            ..MuxConfig::default()
        };
        let (_client, server) = mux_pair(config);
        assert!(matches!(server.accept(), Err(MuxError::Timeout(_))));
        assert!(!server.is_terminated());
    }

    #[test]
    fn abandoned_open_is_closed_when_answered() {
        let config = MuxConfig {
            handshake_timeout_ms: Some(50),
            ..MuxConfig::default()
        };
        let (mux, mut reader, mut writer) = mux_and_raw(config);

        assert!(matches!(mux.open(), Err(MuxError::Timeout(_))));
        assert_eq!(reader.read_header().unwrap(), Header::open());

        writer.accepted(5).unwrap();
        assert_eq!(reader.read_header().unwrap(), Header::close(5));
        assert!(!mux.is_terminated());
    }

    #[test]
    fn roles_are_exclusive() {
        let config = MuxConfig {
            handshake_timeout_ms: Some(20),
            ..MuxConfig::default()
        };
        let (client, _server) = mux_pair(config);
        assert!(matches!(client.open(), Err(MuxError::Timeout(_))));
        assert!(matches!(client.accept(), Err(MuxError::RoleConflict { .. })));
    }

    #[test]
    fn close_unblocks_accept() {
        let (_client, server) = mux_pair(MuxConfig::default());
        thread::scope(|s| {
            let waiter = s.spawn(|| server.accept());
            thread::sleep(Duration::from_millis(30));
            server.close();
            assert!(matches!(
                waiter.join().unwrap(),
                Err(MuxError::Terminated(Termination::Closed))
            ));
        });
        assert_eq!(server.termination(), Some(Termination::Closed));
    }

    #[test]
    fn peer_disconnect_fails_blocked_reader() {
        let (mux, reader, mut writer) = mux_and_raw(MuxConfig::default());
        writer.open().unwrap();
        let channel = mux.accept().unwrap();

        drop(reader);
        drop(writer);

        assert!(matches!(
            channel.read(&mut [0u8; 8]),
            Err(MuxError::Terminated(Termination::TransportClosed))
        ));
        assert_eq!(mux.wait_terminated(Some(WAIT)), Some(Termination::TransportClosed));
        assert!(matches!(mux.accept(), Err(MuxError::Terminated(_))));
    }

    #[test]
    fn payload_for_unknown_channel_is_fatal() {
        let (mux, _reader, mut writer) = mux_and_raw(MuxConfig::default());
        writer.send(42, b"stray").unwrap();
        assert!(matches!(
            mux.wait_terminated(Some(WAIT)),
            Some(Termination::Protocol(msg)) if msg.contains("42")
        ));
    }

    #[test]
    fn unknown_frame_kind_is_fatal() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let mux = Mux::new(left).unwrap();
        right.write_all(&[0xEE; HEADER_SIZE]).unwrap();
        assert!(matches!(
            mux.wait_terminated(Some(WAIT)),
            Some(Termination::Protocol(_))
        ));
    }

    #[test]
    fn accepted_without_open_is_fatal() {
        let (mux, _reader, mut writer) = mux_and_raw(MuxConfig::default());
        writer.accepted(1).unwrap();
        assert!(matches!(
            mux.wait_terminated(Some(WAIT)),
            Some(Termination::Protocol(_))
        ));
    }

    #[test]
    fn open_sent_to_initiator_is_fatal() {
        let (mux, mut reader, mut writer) = mux_and_raw(MuxConfig::default());

        let peer = thread::spawn(move || {
            assert_eq!(reader.read_header().unwrap(), Header::open());
            writer.accepted(1).unwrap();
            writer.open().unwrap();
            writer.send(1, b"data").unwrap();
            (reader, writer)
        });

        let channel = mux.open().unwrap();
        let _peer = peer.join().unwrap();
        assert!(matches!(
            mux.wait_terminated(Some(WAIT)),
            Some(Termination::Protocol(msg)) if msg.contains("OPEN")
        ));
        assert!(matches!(
            channel.read(&mut [0u8; 4]),
            Err(MuxError::Terminated(Termination::Protocol(_)))
        ));
    }

    #[test]
    fn peer_open_latches_acceptor_role() {
        let (mux, _reader, mut writer) = mux_and_raw(MuxConfig::default());
        writer.open().unwrap();

        assert!(eventually(|| mux.role() == Some(Role::Acceptor)));
        assert!(matches!(mux.open(), Err(MuxError::RoleConflict { .. })));
        let channel = mux.accept().unwrap();
        assert_eq!(channel.id(), 0);
    }

    #[test]
    fn read_returns_delivered_bytes_mid_payload() {
        let (mux, _reader, mut writer) = mux_and_raw(MuxConfig::default());
        writer.open().unwrap();
        let channel = mux.accept().unwrap();

        // Announce ten bytes, deliver two.
        let mut partial = Header::payload(channel.id(), 10).unwrap().to_bytes().to_vec();
        partial.extend_from_slice(b"hi");
        writer.get_mut().write_all(&partial).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        thread::scope(|s| {
            let closer = s.spawn(|| mux.close());
            assert!(eventually(|| closer.is_finished()));
        });
        assert_eq!(mux.termination(), Some(Termination::Closed));
    }

    #[test]
    fn close_returns_while_transport_write_is_stalled() {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel::<()>();
        let mux = Mux::new((
            QuietReader(release_rx),
            StalledWriter(entered_tx),
        ))
        .unwrap();

        thread::scope(|s| {
            let opener = s.spawn(|| mux.open());
            entered.recv_timeout(WAIT).unwrap();

            let closer = s.spawn(|| mux.close());
            assert!(eventually(|| closer.is_finished()));
            assert!(matches!(
                opener.join().unwrap(),
                Err(MuxError::Terminated(Termination::Closed))
            ));
        });
        drop(release);
    }

    #[test]
    fn transport_read_error_terminates() {
        let mux = Mux::new((FailingReader, io::sink())).unwrap();
        assert!(matches!(
            mux.wait_terminated(Some(WAIT)),
            Some(Termination::Transport(_))
        ));
        assert!(matches!(mux.open(), Err(MuxError::Terminated(_))));
    }

    #[test]
    fn shutdown_flushes_queued_frames() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (opened, accepted) = open_accept(&client, &server);

        let data = vec![0x5Au8; 40_000];
        let received = thread::scope(|s| {
            let reader = s.spawn(|| read_to_end(&accepted));
            opened.write(&data).unwrap();
            opened.close().unwrap();
            assert_eq!(client.shutdown(), Some(Termination::Closed));
            reader.join().unwrap()
        });
        assert_eq!(received, data);
    }

    #[test]
    fn dropping_mux_stops_channels() {
        let (client, server) = mux_pair(MuxConfig::default());
        let (opened, _accepted) = open_accept(&client, &server);
        drop(client);
        assert!(matches!(
            opened.write(b"x"),
            Err(MuxError::Terminated(Termination::Closed))
        ));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::ConnectionReset))
        }
    }

    /// Read half that stays silent until its sender is dropped.
    struct QuietReader(mpsc::Receiver<()>);

    impl Read for QuietReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    /// Write half whose peer never reads.
    struct StalledWriter(mpsc::Sender<()>);

    impl Write for StalledWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.send(());
            loop {
                thread::park();
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
