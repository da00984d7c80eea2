//! The two-context command pipeline.
//!
//! `UsbSide` runs wherever the USB stack runs.  It reads each bulk OUT packet straight into the
//! next free ring slot and sends the slot's token to `ExecSide` over a mailbox.  `ExecSide` runs
//! each packet through the `Dispatcher`, writes the response and sends the token back, after which
//! `UsbSide` frees the slot.  When the ring is full `UsbSide` stops reading the transport, leaving
//! further packets queued on the host side of the bulk endpoint.
//!
//! On a dual-core part the two sides run on separate cores and exchange tokens through the
//! inter-core FIFOs.  A single-core build alternates the two in one loop with `LocalMailbox`es
//! (see `single_context_step`), and the dispatcher then services USB from inside long transfers.
use heapless::spsc::{self, Queue};

use crate::command::{Dispatcher, Outcome, ResponseSink, PACKET_SIZE};
use crate::error::Result;
use crate::link::{Link, NoYield, Yield};
use crate::ring::{Consumer, Producer, RING_SLOTS};

/// A single-word, order-preserving channel to the other context.
///
/// Implementations must buffer at least `RING_SLOTS` words in each direction, so that neither
/// context can block on a push while the other is blocked pushing back.
pub trait Mailbox {
    fn push_blocking(&mut self, word: u32);
    fn pop_blocking(&mut self) -> u32;
    fn try_pop(&mut self) -> Option<u32>;
}

/// The receive half of the vendor bulk interface.
pub trait Transport {
    /// Run the USB device stack.
    fn poll(&mut self);
    /// Copy one received packet into `buf` and return its length, or 0 when nothing is pending.
    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> usize;
}

/// A collaborator that gets the USB context's idle time, such as a serial bridge.
pub trait AuxBridge {
    fn service(&mut self);
}

impl AuxBridge for () {
    fn service(&mut self) {}
}

/// What one `UsbSide::poll` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    /// A packet was queued for execution.
    Received,
    /// Nothing was pending on the transport.
    Idle,
    /// Every slot is in use; the transport was left alone.
    Backpressure,
}

pub struct UsbSide<'a, T, M, A> {
    producer: Producer<'a>,
    transport: T,
    mailbox: M,
    aux: A,
}

impl<'a, T: Transport, M: Mailbox, A: AuxBridge> UsbSide<'a, T, M, A> {
    pub fn new(producer: Producer<'a>, transport: T, mailbox: M, aux: A) -> Self {
        Self { producer, transport, mailbox, aux }
    }

    pub fn poll(&mut self) -> Result<Poll> {
        while let Some(word) = self.mailbox.try_pop() {
            self.producer.reclaim(word)?;
            log::trace!("slot {} released", word);
        }

        if self.producer.is_full() {
            self.aux.service();
            return Ok(Poll::Backpressure);
        }

        // The packet must be read in the same pass as the stack poll that received it, or two
        // bulk OUT transfers can be merged into one read.
        self.transport.poll();
        let transport = &mut self.transport;
        match self.producer.fill(|buf| transport.read_packet(buf)) {
            Some(token) => {
                let word = token.word();
                log::trace!("slot {} filled", word);
                self.mailbox.push_blocking(word);
                Ok(Poll::Received)
            }
            None => {
                self.aux.service();
                Ok(Poll::Idle)
            }
        }
    }

    pub fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.poll() {
                log::error!("USB side: {}", e);
            }
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn producer(&self) -> &Producer<'a> {
        &self.producer
    }
}

pub struct ExecSide<'a, L, S, M> {
    consumer: Consumer<'a>,
    dispatcher: Dispatcher<L>,
    sink: S,
    mailbox: M,
}

impl<'a, L: Link, S: ResponseSink, M: Mailbox> ExecSide<'a, L, S, M> {
    pub fn new(consumer: Consumer<'a>, dispatcher: Dispatcher<L>, sink: S, mailbox: M) -> Self {
        Self { consumer, dispatcher, sink, mailbox }
    }

    /// Wait for the next packet and execute it.
    pub fn run_once(&mut self) -> Result<Outcome> {
        let word = self.mailbox.pop_blocking();
        self.execute(word, &mut NoYield)
    }

    /// Execute the next packet if one is waiting.  `idle` runs while long transfers are in flight.
    pub fn try_run_once(&mut self, idle: &mut dyn Yield) -> Result<Option<Outcome>> {
        match self.mailbox.try_pop() {
            Some(word) => self.execute(word, idle).map(Some),
            None => Ok(None),
        }
    }

    fn execute(&mut self, word: u32, idle: &mut dyn Yield) -> Result<Outcome> {
        let packet = self.consumer.acquire(word)?;
        log::trace!("executing slot {} ({} bytes)", word, packet.bytes().len());
        let result = self.dispatcher.execute_packet(packet.bytes(), &mut self.sink, idle);
        // The slot goes back even when the link failed.
        self.mailbox.push_blocking(packet.release().word());
        result
    }

    pub fn run(&mut self) -> ! {
        loop {
            match self.run_once() {
                Ok(outcome) => log::trace!("packet done: {:?}", outcome),
                Err(e) => log::error!("packet failed: {}", e),
            }
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<L> {
        &self.dispatcher
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// One pass of a single-context probe: service USB, then execute at most one packet, servicing
/// USB again from inside any DMA wait.
pub fn single_context_step<T, A, L, S, MU, ME>(usb: &mut UsbSide<'_, T, MU, A>, exec: &mut ExecSide<'_, L, S, ME>)
    -> Result<Option<Outcome>> where T: Transport, A: AuxBridge, MU: Mailbox, L: Link, S: ResponseSink, ME: Mailbox {
    usb.poll()?;
    let mut service_usb = || {
        if let Err(e) = usb.poll() {
            log::error!("USB side: {}", e);
        }
    };
    exec.try_run_once(&mut service_usb)
}

const QUEUE_LEN: usize = RING_SLOTS + 1;

/// Backing storage for one direction of a `LocalMailbox` pair.
pub type MailboxQueue = Queue<u32, QUEUE_LEN>;

/// One end of an in-memory mailbox pair, for running both sides in one context.
pub struct LocalMailbox<'q> {
    tx: spsc::Producer<'q, u32, QUEUE_LEN>,
    rx: spsc::Consumer<'q, u32, QUEUE_LEN>,
}

/// Connect two local mailbox ends: the first for `UsbSide`, the second for `ExecSide`.
pub fn local_mailboxes<'q>(ready: &'q mut MailboxQueue, free: &'q mut MailboxQueue)
    -> (LocalMailbox<'q>, LocalMailbox<'q>)
{
    let (ready_tx, ready_rx) = ready.split();
    let (free_tx, free_rx) = free.split();
    (LocalMailbox { tx: ready_tx, rx: free_rx }, LocalMailbox { tx: free_tx, rx: ready_rx })
}

impl Mailbox for LocalMailbox<'_> {
    fn push_blocking(&mut self, mut word: u32) {
        // The queue holds RING_SLOTS words, so this only spins if the ring invariant is broken.
        while let Err(w) = self.tx.enqueue(word) {
            word = w;
            core::hint::spin_loop();
        }
    }

    fn pop_blocking(&mut self) -> u32 {
        loop {
            if let Some(word) = self.rx.dequeue() {
                return word;
            }
            core::hint::spin_loop();
        }
    }

    fn try_pop(&mut self) -> Option<u32> {
        self.rx.dequeue()
    }
}

#[cfg(feature = "std")]
pub use self::threads::{std_mailboxes, StdMailbox};

#[cfg(feature = "std")]
mod threads {
    use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};

    use super::Mailbox;
    use crate::ring::RING_SLOTS;

    /// One end of a mailbox pair between two threads.
    pub struct StdMailbox {
        tx: SyncSender<u32>,
        rx: Receiver<u32>,
    }

    /// Connect two thread mailbox ends: the first for `UsbSide`, the second for `ExecSide`.
    pub fn std_mailboxes() -> (StdMailbox, StdMailbox) {
        let (ready_tx, ready_rx) = sync_channel(RING_SLOTS);
        let (free_tx, free_rx) = sync_channel(RING_SLOTS);
        (StdMailbox { tx: ready_tx, rx: free_rx }, StdMailbox { tx: free_tx, rx: ready_rx })
    }

    impl Mailbox for StdMailbox {
        fn push_blocking(&mut self, word: u32) {
            if self.tx.send(word).is_err() {
                log::warn!("mailbox peer is gone, dropping word {}", word);
            }
        }

        fn pop_blocking(&mut self) -> u32 {
            match self.rx.recv() {
                Ok(word) => word,
                // Nothing can ever arrive; wait forever like a hardware FIFO would.
                Err(_) => loop {
                    std::thread::park();
                },
            }
        }

        fn try_pop(&mut self) -> Option<u32> {
            match self.rx.try_recv() {
                Ok(word) => Some(word),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::Writes;
    use crate::command::INFO;
    use crate::link::shift::tests::{loopback_link, TestLink};
    use crate::ring::{CommandRing, SlotState};
    use std::collections::VecDeque;
    use std::vec;
    use std::vec::Vec;

    /// Bulk OUT packets waiting on the host side.
    #[derive(Default)]
    struct HostQueue {
        packets: VecDeque<Vec<u8>>,
        polls: usize,
    }

    impl HostQueue {
        fn with(packets: &[&[u8]]) -> Self {
            Self { packets: packets.iter().map(|p| p.to_vec()).collect(), polls: 0 }
        }
    }

    impl Transport for HostQueue {
        fn poll(&mut self) {
            self.polls += 1;
        }

        fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE]) -> usize {
            match self.packets.pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    packet.len()
                }
                None => 0,
            }
        }
    }

    #[derive(Default)]
    struct Bridge {
        calls: usize,
    }

    impl AuxBridge for Bridge {
        fn service(&mut self) {
            self.calls += 1;
        }
    }

    #[test]
    fn backpressure_stops_reading() {
        let mut ring = CommandRing::new();
        let (producer, consumer) = ring.split();
        let (mut ready, mut free) = (MailboxQueue::new(), MailboxQueue::new());
        let (usb_mb, exec_mb) = local_mailboxes(&mut ready, &mut free);

        let packets: Vec<&[u8]> = vec![&[0x05][..]; 6];
        let mut usb = UsbSide::new(producer, HostQueue::with(&packets), usb_mb, Bridge::default());
        let mut exec = ExecSide::new(consumer, Dispatcher::new(loopback_link()), Writes::default(), exec_mb);

        for _ in 0..RING_SLOTS {
            assert_eq!(usb.poll(), Ok(Poll::Received));
        }
        let polls = usb.transport().polls;
        assert_eq!(usb.poll(), Ok(Poll::Backpressure));
        assert_eq!(usb.poll(), Ok(Poll::Backpressure));
        assert_eq!(usb.transport().polls, polls);
        assert_eq!(usb.transport().packets.len(), 2);
        assert_eq!(usb.aux.calls, 2);

        // Executing releases the slot, but it stays taken until the USB side reclaims it.
        assert_eq!(exec.run_once(), Ok(Outcome::Completed));
        assert_eq!(usb.producer().state(0), SlotState::Released);
        assert_eq!(usb.poll(), Ok(Poll::Received));
        assert_eq!(usb.transport().packets.len(), 1);
        assert_eq!(usb.poll(), Ok(Poll::Backpressure));
    }

    #[test]
    fn idle_polls_service_bridge() {
        let mut ring = CommandRing::new();
        let (producer, _consumer) = ring.split();
        let (mut ready, mut free) = (MailboxQueue::new(), MailboxQueue::new());
        let (usb_mb, _exec_mb) = local_mailboxes(&mut ready, &mut free);
        let mut usb = UsbSide::new(producer, HostQueue::default(), usb_mb, Bridge::default());

        assert_eq!(usb.poll(), Ok(Poll::Idle));
        assert_eq!(usb.poll(), Ok(Poll::Idle));
        assert_eq!(usb.aux.calls, 2);
        assert_eq!(usb.producer().in_flight(), 0);
    }

    #[test]
    fn single_context_services_usb_during_long_transfers() {
        let mut ring = CommandRing::new();
        let (producer, consumer) = ring.split();
        let (mut ready, mut free) = (MailboxQueue::new(), MailboxQueue::new());
        let (usb_mb, exec_mb) = local_mailboxes(&mut ready, &mut free);

        let mut long = vec![0x03, 0xf0];
        long.extend((0..30).map(|i| i as u8));
        let sample = [0x04, 0x04, 0x04, 0x04, 0x02, 0x02, 0x05];
        let packets: Vec<&[u8]> = vec![&long[..], &[0x01][..], &sample[..], &[0x05][..]];
        let mut usb = UsbSide::new(producer, HostQueue::with(&packets), usb_mb, ());
        let mut exec = ExecSide::new(consumer, Dispatcher::new(loopback_link()), Writes::default(), exec_mb);

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            if let Some(outcome) = single_context_step(&mut usb, &mut exec).unwrap() {
                outcomes.push(outcome);
            }
        }
        assert_eq!(outcomes, [Outcome::Completed; 4]);
        assert!(usb.transport().packets.is_empty());

        let writes = &exec.sink().0;
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0][..], long[2..]);
        assert_eq!(writes[1][..], INFO[..]);
        assert_eq!(writes[2], [0x08]);
        assert_eq!(writes[3], [0x08]);

        usb.poll().unwrap();
        assert_eq!(usb.producer().in_flight(), 0);
    }

    #[test]
    fn stalled_packet_still_returns_its_slot() {
        use crate::config::ProbeConfig;
        use crate::error::Error;
        use crate::link::loopback::{Loopback, LoopbackDma};
        use crate::link::shift::tests::FakePin;
        use crate::link::shift::ShiftLink;

        let mut loopback = Loopback::new();
        loopback.stall();
        let config = ProbeConfig { stall_limit: Some(10), ..ProbeConfig::default() };
        let link = ShiftLink::new(loopback, LoopbackDma, FakePin::default(), FakePin::default(),
                                  FakePin::default(), &config).unwrap();

        let mut ring = CommandRing::new();
        let (producer, consumer) = ring.split();
        let (mut ready, mut free) = (MailboxQueue::new(), MailboxQueue::new());
        let (usb_mb, exec_mb) = local_mailboxes(&mut ready, &mut free);
        let packets: Vec<&[u8]> = vec![&[0x03, 0x08, 0xaa][..], &[0x01][..]];
        let mut usb = UsbSide::new(producer, HostQueue::with(&packets), usb_mb, ());
        let mut exec = ExecSide::new(consumer, Dispatcher::new(link), Writes::default(), exec_mb);

        usb.poll().unwrap();
        usb.poll().unwrap();
        assert_eq!(exec.run_once(), Err(Error::Stalled));
        assert_eq!(exec.run_once(), Ok(Outcome::Completed));
        assert_eq!(exec.sink().0, vec![INFO.to_vec()]);
        usb.poll().unwrap();
        assert_eq!(usb.producer().in_flight(), 0);
    }

    #[test]
    #[cfg(feature = "std")]
    fn two_threads() {
        use std::sync::mpsc::{channel, Sender};

        struct Responses(Sender<Vec<u8>>);

        impl ResponseSink for Responses {
            fn write(&mut self, data: &[u8]) {
                let _ = self.0.send(data.to_vec());
            }
        }

        const PACKETS: usize = 40;
        let requests: Vec<Vec<u8>> = (0..PACKETS)
            .map(|i| vec![0x03, 16, i as u8, !(i as u8), 0x05])
            .collect();
        let request_refs: Vec<&[u8]> = requests.iter().map(|r| r.as_slice()).collect();

        let mut ring = CommandRing::new();
        let (producer, consumer) = ring.split();
        let (usb_mb, exec_mb) = std_mailboxes();
        let (tx, rx) = channel();

        let mut usb = UsbSide::new(producer, HostQueue::with(&request_refs), usb_mb, ());
        let mut exec: ExecSide<'_, TestLink, _, _> =
            ExecSide::new(consumer, Dispatcher::new(loopback_link()), Responses(tx), exec_mb);

        std::thread::scope(|s| {
            s.spawn(move || {
                for _ in 0..PACKETS {
                    exec.run_once().unwrap();
                }
            });
            s.spawn(move || {
                while !usb.transport().packets.is_empty() || usb.producer().in_flight() > 0 {
                    usb.poll().unwrap();
                    std::thread::yield_now();
                }
            });
        });

        let responses: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(responses.len(), PACKETS);
        for (i, response) in responses.iter().enumerate() {
            assert_eq!(response[..], [i as u8, !(i as u8), 0x00]);
        }
    }
}
