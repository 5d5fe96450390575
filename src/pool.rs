//! PCB and segment pools
//!
//! PCBs live in a generational arena. A `PcbId` names a slot together with
//! the generation it was issued for, so a handle to a freed (and possibly
//! reused) slot resolves to nothing instead of to somebody else's
//! connection. List membership is intrusive: each slot carries the list it
//! is on and prev/next indices, giving O(1) register and remove.

use std::collections::VecDeque;

use crate::err::{Error, Result};
use crate::state::{ListenPcb, Pcb, PcbList, TcpPcb};
use crate::tcp_types::TcpSeg;

/// Handle to a PCB in a `TcpStack`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PcbId {
    idx: u32,
    generation: u32,
}

impl PcbId {
    /// Slot index, stable for the lifetime of the PCB
    pub fn index(&self) -> usize {
        self.idx as usize
    }
}

#[derive(Debug, Default)]
struct Links {
    list: Option<PcbList>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    pcb: Option<Pcb>,
    links: Links,
}

/// Bounded pool of connection and listener PCBs plus the four lists
#[derive(Debug)]
pub(crate) struct PcbPool {
    entries: Vec<Entry>,
    free: Vec<u32>,
    heads: [Option<u32>; 4],
    conns: usize,
    listeners: usize,
    max_conns: usize,
    max_listeners: usize,
}

impl PcbPool {
    pub(crate) fn new(max_conns: usize, max_listeners: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_conns + max_listeners),
            free: Vec::new(),
            heads: [None; 4],
            conns: 0,
            listeners: 0,
            max_conns,
            max_listeners,
        }
    }

    pub(crate) fn conns_full(&self) -> bool {
        self.conns >= self.max_conns
    }

    pub(crate) fn listeners_full(&self) -> bool {
        self.listeners >= self.max_listeners
    }

    pub(crate) fn conn_count(&self) -> usize {
        self.conns
    }

    pub(crate) fn listen_count(&self) -> usize {
        self.listeners
    }

    fn insert(&mut self, pcb: Pcb) -> PcbId {
        let idx = match self.free.pop() {
            Some(idx) => {
                let entry = &mut self.entries[idx as usize];
                entry.pcb = Some(pcb);
                entry.links = Links::default();
                idx
            }
            None => {
                self.entries.push(Entry { generation: 0, pcb: Some(pcb), links: Links::default() });
                (self.entries.len() - 1) as u32
            }
        };
        PcbId { idx, generation: self.entries[idx as usize].generation }
    }

    /// Take a connection slot. `Mem` when the pool is exhausted.
    pub(crate) fn alloc_conn(&mut self, pcb: TcpPcb) -> Result<PcbId> {
        if self.conns_full() {
            return Err(Error::Mem);
        }
        self.conns += 1;
        Ok(self.insert(Pcb::Conn(Box::new(pcb))))
    }

    fn entry(&self, id: PcbId) -> Option<&Entry> {
        self.entries
            .get(id.index())
            .filter(|e| e.generation == id.generation && e.pcb.is_some())
    }

    fn entry_mut(&mut self, id: PcbId) -> Option<&mut Entry> {
        self.entries
            .get_mut(id.index())
            .filter(|e| e.generation == id.generation && e.pcb.is_some())
    }

    pub(crate) fn contains(&self, id: PcbId) -> bool {
        self.entry(id).is_some()
    }

    pub(crate) fn get(&self, id: PcbId) -> Option<&Pcb> {
        self.entry(id)?.pcb.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.entry_mut(id)?.pcb.as_mut()
    }

    pub(crate) fn conn(&self, id: PcbId) -> Option<&TcpPcb> {
        match self.get(id)? {
            Pcb::Conn(pcb) => Some(pcb),
            Pcb::Listen(_) => None,
        }
    }

    pub(crate) fn conn_mut(&mut self, id: PcbId) -> Option<&mut TcpPcb> {
        match self.get_mut(id)? {
            Pcb::Conn(pcb) => Some(pcb),
            Pcb::Listen(_) => None,
        }
    }

    pub(crate) fn listener_mut(&mut self, id: PcbId) -> Option<&mut ListenPcb> {
        match self.get_mut(id)? {
            Pcb::Listen(lpcb) => Some(lpcb),
            Pcb::Conn(_) => None,
        }
    }

    /// Release a slot. The PCB must already be off every list.
    pub(crate) fn free(&mut self, id: PcbId) -> Option<Pcb> {
        let entry = self.entry_mut(id)?;
        debug_assert!(entry.links.list.is_none(), "freeing a PCB that is still on a list");
        let pcb = entry.pcb.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        match pcb {
            Pcb::Conn(_) => self.conns -= 1,
            Pcb::Listen(_) => self.listeners -= 1,
        }
        self.free.push(id.idx);
        Some(pcb)
    }

    /// Swap a slot's payload, keeping its handle and list membership.
    /// Counters follow the payload kind. Returns the old payload.
    pub(crate) fn replace(&mut self, id: PcbId, new: Pcb) -> Option<Pcb> {
        let new_is_conn = matches!(new, Pcb::Conn(_));
        let old = self.entry_mut(id)?.pcb.replace(new)?;
        match old {
            Pcb::Conn(_) => self.conns -= 1,
            Pcb::Listen(_) => self.listeners -= 1,
        }
        if new_is_conn {
            self.conns += 1;
        } else {
            self.listeners += 1;
        }
        Some(old)
    }

    fn id_at(&self, idx: u32) -> PcbId {
        PcbId { idx, generation: self.entries[idx as usize].generation }
    }

    // ------------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------------

    /// TCP_REG: push on the front of `list`.
    pub(crate) fn reg(&mut self, list: PcbList, id: PcbId) {
        if !self.contains(id) {
            return;
        }
        debug_assert!(self.entries[id.index()].links.list.is_none(), "PCB already on a list");
        let old_head = self.heads[list.index()];
        if let Some(h) = old_head {
            self.entries[h as usize].links.prev = Some(id.idx);
        }
        let links = &mut self.entries[id.index()].links;
        links.list = Some(list);
        links.prev = None;
        links.next = old_head;
        self.heads[list.index()] = Some(id.idx);
    }

    /// TCP_RMV: unlink from whichever list the PCB is on. No-op when it is
    /// on none.
    pub(crate) fn rmv(&mut self, id: PcbId) {
        let Some(entry) = self.entry_mut(id) else { return };
        let Some(list) = entry.links.list.take() else { return };
        let prev = entry.links.prev.take();
        let next = entry.links.next.take();
        match prev {
            Some(p) => self.entries[p as usize].links.next = next,
            None => self.heads[list.index()] = next,
        }
        if let Some(n) = next {
            self.entries[n as usize].links.prev = prev;
        }
    }

    pub(crate) fn list_of(&self, id: PcbId) -> Option<PcbList> {
        self.entry(id)?.links.list
    }

    pub(crate) fn first(&self, list: PcbList) -> Option<PcbId> {
        self.heads[list.index()].map(|idx| self.id_at(idx))
    }

    /// Successor of `id` on its list.
    pub(crate) fn next(&self, id: PcbId) -> Option<PcbId> {
        self.entry(id)?.links.next.map(|idx| self.id_at(idx))
    }

    /// Snapshot of a list in order, head first.
    pub(crate) fn ids(&self, list: PcbList) -> Vec<PcbId> {
        let mut out = Vec::new();
        let mut cur = self.first(list);
        while let Some(id) = cur {
            out.push(id);
            cur = self.next(id);
        }
        out
    }

    /// Iterate the PCBs of a list.
    pub(crate) fn iter(&self, list: PcbList) -> impl Iterator<Item = (PcbId, &Pcb)> + '_ {
        let mut cur = self.first(list);
        core::iter::from_fn(move || {
            let id = cur?;
            cur = self.next(id);
            Some((id, self.get(id)?))
        })
    }

    /// Every live PCB, on a list or not.
    pub(crate) fn all(&self) -> impl Iterator<Item = (PcbId, &Pcb, Option<PcbList>)> + '_ {
        self.entries.iter().enumerate().filter_map(|(idx, e)| {
            let pcb = e.pcb.as_ref()?;
            Some((PcbId { idx: idx as u32, generation: e.generation }, pcb, e.links.list))
        })
    }
}

/// Segment pool accounting (MEMP_TCP_SEG)
#[derive(Debug, Clone)]
pub struct SegPool {
    used: usize,
    capacity: usize,
}

impl SegPool {
    pub fn new(capacity: usize) -> Self {
        Self { used: 0, capacity }
    }

    /// Reserve one segment. `Mem` when the pool is exhausted.
    pub fn alloc(&mut self) -> Result<()> {
        if self.used >= self.capacity {
            log::warn!("tcp: segment pool exhausted ({} in use)", self.used);
            return Err(Error::Mem);
        }
        self.used += 1;
        Ok(())
    }

    pub fn release(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.used = self.used.saturating_sub(n);
    }

    /// Free a whole chain, returning its units.
    pub fn free_chain(&mut self, chain: &mut VecDeque<TcpSeg>) {
        self.release(chain.len());
        chain.clear();
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }
}
