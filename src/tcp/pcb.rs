//! Component B: the fixed Protocol Control Block pool (spec §3, §4.B).

use std::collections::VecDeque;
use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::tcp::segment::Flags;
use crate::tcp::state::State;

pub const PCB_TABLE_SIZE: usize = 16;
pub const RECV_BUF_SIZE: usize = 65_535;
pub const DEFAULT_RTO_USEC: u64 = 200_000;
pub const RETRANS_DEADLINE_SECS: u64 = 12;

#[derive(Debug, Clone, Copy, Default)]
pub struct SendVars {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
    pub wl1: u32,
    pub wl2: u32,
    pub iss: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecvVars {
    pub nxt: u32,
    pub wnd: u16,
    pub up: u16,
    pub irs: u32,
}

/// One outstanding unacknowledged segment (spec §3 "Unacknowledged-segment
/// entry"). `consume` is the number of sequence-space bytes it occupies:
/// payload length plus one for each of SYN/FIN.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub rto_usec: u64,
    pub seq: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

impl QueueEntry {
    pub fn consume(&self) -> u32 {
        let mut n = self.payload.len() as u32;
        if self.flags.syn() {
            n += 1;
        }
        if self.flags.fin() {
            n += 1;
        }
        n
    }
}

pub struct Pcb {
    pub state: State,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub snd: SendVars,
    pub rcv: RecvVars,
    pub mss: u16,
    /// Occupied bytes live in `buf[0 .. RECV_BUF_SIZE - rcv.wnd)` (invariant 2).
    pub buf: Vec<u8>,
    pub queue: VecDeque<QueueEntry>,
}

impl Pcb {
    fn free() -> Self {
        Pcb {
            state: State::None,
            local: Endpoint::WILDCARD,
            remote: Endpoint::WILDCARD,
            snd: SendVars::default(),
            rcv: RecvVars::default(),
            mss: 0,
            buf: vec![0u8; RECV_BUF_SIZE],
            queue: VecDeque::new(),
        }
    }

    /// Bytes currently held in the receive buffer.
    pub fn recv_occupancy(&self) -> usize {
        RECV_BUF_SIZE - self.rcv.wnd as usize
    }
}

/// The fixed pool of 16 PCBs (spec §3: "Fixed pool of 16 PCBs, externally
/// addressable by an integer descriptor equal to the slot index").
///
/// The suspend/resume [`Task`](crate::task::Task) a waiter parks on is
/// deliberately not a field here: it lives in a same-sized array next to
/// this table (see `Engine`), since a blocked command must be able to call
/// `Condvar::wait` (which needs to own the `MutexGuard` covering this
/// table) while simultaneously holding a reference into the table it
/// guards -- the borrow checker (rightly) forbids that for a field.
pub struct PcbTable {
    slots: Vec<Pcb>,
}

impl PcbTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(PCB_TABLE_SIZE);
        for _ in 0..PCB_TABLE_SIZE {
            slots.push(Pcb::free());
        }
        PcbTable { slots }
    }

    /// Allocate the first free slot, transition it to CLOSED, and return
    /// its descriptor. Fails if the table is full.
    pub fn alloc(&mut self) -> Option<i32> {
        for (i, pcb) in self.slots.iter_mut().enumerate() {
            if pcb.state == State::None {
                pcb.state = State::Closed;
                pcb.local = Endpoint::WILDCARD;
                pcb.remote = Endpoint::WILDCARD;
                pcb.snd = SendVars::default();
                pcb.rcv = RecvVars::default();
                pcb.mss = 0;
                pcb.queue.clear();
                return Some(i as i32);
            }
        }
        None
    }

    pub fn get(&self, desc: i32) -> Option<&Pcb> {
        let i = usize::try_from(desc).ok()?;
        let pcb = self.slots.get(i)?;
        (pcb.state != State::None).then_some(pcb)
    }

    pub fn get_mut(&mut self, desc: i32) -> Option<&mut Pcb> {
        let i = usize::try_from(desc).ok()?;
        let pcb = self.slots.get_mut(i)?;
        (pcb.state != State::None).then_some(pcb)
    }

    /// Unconditionally drain the queue and zero a slot back to NONE.
    /// Callers (the `Engine`) are responsible for first checking that no
    /// task still has waiters parked on this descriptor.
    pub fn free_slot(&mut self, desc: i32) {
        let Some(i) = usize::try_from(desc).ok() else { return };
        let Some(pcb) = self.slots.get_mut(i) else { return };
        pcb.queue.clear();
        *pcb = Pcb::free();
    }

    pub fn iter_live(&mut self) -> impl Iterator<Item = (i32, &mut Pcb)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, pcb)| pcb.state != State::None)
            .map(|(i, pcb)| (i as i32, pcb))
    }

    /// Find the best-matching PCB for an arriving segment addressed
    /// `local <- remote` (spec §4.B match rules). A CLOSED-state slot can
    /// still be returned here -- `Engine::segment_arrives` is what turns a
    /// CLOSED match into the "no connection" RST path (spec §4.C step 1),
    /// mirroring `tcp_pcb_select`/`tcp_segment_arrives` in the original.
    pub fn select(&self, local: Endpoint, remote: Endpoint) -> Option<i32> {
        let mut candidate = None;

        for (i, pcb) in self.slots.iter().enumerate() {
            if pcb.state == State::None {
                continue;
            }
            if pcb.local.port != local.port {
                continue;
            }
            let local_matches = pcb.local.addr == local.addr
                || pcb.local.addr == crate::endpoint::ANY_ADDR
                || local.addr != crate::endpoint::ANY_ADDR;
            if !local_matches {
                continue;
            }
            let remote_matches = pcb.remote == remote || pcb.remote.is_wildcard();
            if !remote_matches {
                continue;
            }

            if pcb.state != State::Listen {
                return Some(i as i32);
            }
            candidate = Some(i as i32);
        }

        candidate
    }
}

impl Default for PcbTable {
    fn default() -> Self {
        Self::new()
    }
}
