use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info_span;

use crate::config::{EndpointConfig, SessionParams};
use crate::endpoint::Endpoint;
use crate::frame::DataFrame;
use crate::shared::{Event, Side, Transmit, TransmitKind};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_default(sub)
}

/// What a link filter decided to do with one outbound datagram
///
/// The returned copies are what actually crosses the link: empty drops the
/// datagram, two copies duplicates it.
pub(super) type Filter = Box<dyn FnMut(&Transmit) -> Vec<Bytes>>;

/// Two endpoints joined by a simulated datagram link with virtual time
pub(super) struct Pair {
    pub(super) client: TestPeer,
    pub(super) server: TestPeer,
    pub(super) time: Instant,
    /// One-way delivery delay
    pub(super) latency: Duration,
}

impl Pair {
    pub(super) fn new(config: EndpointConfig) -> Self {
        let client = Endpoint::new_seeded(config.clone(), Side::Client, 0x1000);
        let server = Endpoint::new_seeded(config, Side::Server, 0x2000);
        Self {
            client: TestPeer::new(client),
            server: TestPeer::new(server),
            time: Instant::now(),
            latency: Duration::from_millis(5),
        }
    }

    /// Run both peers until the simulation is quiescent
    pub(super) fn drive(&mut self) {
        for _ in 0..10_000 {
            if !self.step() {
                return;
            }
        }
        panic!("simulation did not converge");
    }

    /// Process everything due at the current instant, then hop to the next
    /// deadline; returns whether there is more to do
    pub(super) fn step(&mut self) -> bool {
        self.drive_all();
        let next = [self.client.next_wakeup(), self.server.next_wakeup()]
            .into_iter()
            .flatten()
            .min();
        match next {
            Some(t) => {
                self.time = self.time.max(t);
                true
            }
            None => false,
        }
    }

    /// Run both peers and the link until nothing further happens at `time`
    fn drive_all(&mut self) {
        loop {
            {
                let span = info_span!("client");
                let _guard = span.enter();
                self.client.drive(self.time);
            }
            {
                let span = info_span!("server");
                let _guard = span.enter();
                self.server.drive(self.time);
            }
            let sent = transfer(&mut self.client, &mut self.server, self.time, self.latency)
                | transfer(&mut self.server, &mut self.client, self.time, self.latency);
            if !sent && !self.client.has_due(self.time) && !self.server.has_due(self.time) {
                return;
            }
        }
    }
}

/// Move outbound datagrams across the link, applying the sender's filter
fn transfer(from: &mut TestPeer, to: &mut TestPeer, now: Instant, latency: Duration) -> bool {
    let mut any = false;
    while let Some(transmit) = from.endpoint.poll_transmit() {
        any = true;
        let deliveries = match &mut from.filter {
            Some(filter) => filter(&transmit),
            None => vec![transmit.contents.clone()],
        };
        from.outbound.push(transmit);
        for contents in deliveries {
            to.inbound.push_back((now + latency, contents));
        }
    }
    any
}

pub(super) struct TestPeer {
    pub(super) endpoint: Endpoint,
    inbound: VecDeque<(Instant, Bytes)>,
    pub(super) events: Vec<Event>,
    /// Everything this peer ever handed to the link, pre-filter
    pub(super) outbound: Vec<Transmit>,
    pub(super) filter: Option<Filter>,
}

impl TestPeer {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            inbound: VecDeque::new(),
            events: Vec::new(),
            outbound: Vec::new(),
            filter: None,
        }
    }

    fn drive(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.inbound.front() {
            if at > now {
                break;
            }
            let (_, datagram) = self.inbound.pop_front().unwrap();
            self.endpoint.handle_datagram(now, datagram);
        }
        self.endpoint.handle_timeout(now);
        while let Some(event) = self.endpoint.poll() {
            self.events.push(event);
        }
    }

    fn has_due(&self, now: Instant) -> bool {
        self.inbound.front().is_some_and(|&(at, _)| at <= now)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let inbound = self.inbound.front().map(|&(at, _)| at);
        [self.endpoint.next_timeout(), inbound]
            .into_iter()
            .flatten()
            .min()
    }

    /// Data frames this peer emitted for the given block number
    pub(super) fn data_frames_for_block(&self, block_number: u16) -> usize {
        self.outbound
            .iter()
            .filter_map(data_frame)
            .filter(|f| f.block_number == block_number)
            .count()
    }

    /// Offsets and payloads of every `Block` event seen, in order
    pub(super) fn blocks(&self) -> Vec<(u64, Bytes)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Block { offset, data, .. } => Some((*offset, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Reassemble `Block` events, asserting offsets are contiguous from zero
    pub(super) fn assembled(&self) -> Vec<u8> {
        let mut object = Vec::new();
        for (offset, data) in self.blocks() {
            assert_eq!(offset, object.len() as u64, "block offsets must be contiguous");
            object.extend_from_slice(&data);
        }
        object
    }
}

pub(super) fn data_frame(transmit: &Transmit) -> Option<DataFrame> {
    if transmit.kind != TransmitKind::Data {
        return None;
    }
    Some(DataFrame::decode(transmit.contents.clone()).expect("emitted data frame must decode"))
}

/// Parameters small enough to watch individual blocks in tests
pub(super) fn test_params() -> SessionParams {
    SessionParams {
        block_size: 100,
        window_size: 4,
        timeout: Duration::from_millis(100),
        max_retransmits: 3,
        session_expiry: Duration::from_secs(30),
    }
}

/// An object whose content encodes its own offsets, so misplaced blocks are
/// conspicuous
pub(super) fn test_object(len: usize) -> Bytes {
    (0..len).map(|i| i as u8).collect::<Vec<_>>().into()
}

/// Drop the first `n` datagrams matching `predicate`, pass everything else
pub(super) fn drop_first(n: usize, mut predicate: impl FnMut(&Transmit) -> bool + 'static) -> Filter {
    let mut remaining = n;
    Box::new(move |t| {
        if remaining > 0 && predicate(t) {
            remaining -= 1;
            vec![]
        } else {
            vec![t.contents.clone()]
        }
    })
}
