//! TCP Application and Network Interfaces
//!
//! `TcpHandler` is the upward capability: one object per connection (or
//! listener) receiving the events lwIP delivers through its `recv`, `sent`,
//! `connected`, `poll`, `accept` and `errf` callbacks. `NetIf` is the
//! downward capability: hand a finished segment to IP and resolve a route.
//!
//! A handler is taken out of its PCB while it runs, so it may freely call
//! back into the `TcpStack` (including closing or aborting its own PCB). It
//! is put back afterwards if the PCB still exists and nobody installed a
//! different handler in the meantime.

use std::net::IpAddr;

use crate::err::{Error, Result};
use crate::pool::PcbId;
use crate::state::Pcb;
use crate::tcp::TcpStack;
use crate::tcp_types::OutSegment;

/// Per-connection event sink
pub trait TcpHandler {
    /// Data arrived (`Some`) or the peer closed its side (`None`).
    ///
    /// Returning an error other than `Abrt` refuses the data; the stack
    /// keeps it and offers it again from the fast timer. Return `Abrt`
    /// only after aborting `pcb`.
    fn recv(&mut self, stack: &mut TcpStack, pcb: PcbId, data: Option<&[u8]>) -> Result<()> {
        match data {
            Some(data) => {
                stack.recved(pcb, u16::try_from(data.len()).unwrap_or(u16::MAX))?;
                Ok(())
            }
            None => stack.close(pcb),
        }
    }

    /// `len` bytes of sent data were acknowledged.
    fn sent(&mut self, _stack: &mut TcpStack, _pcb: PcbId, _len: u16) -> Result<()> {
        Ok(())
    }

    /// An active open completed.
    fn connected(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<()> {
        Ok(())
    }

    /// Periodic poll, every `pollinterval` slow ticks.
    fn poll(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<()> {
        Ok(())
    }

    /// A listener accepted `new_pcb`. Called on the listener's handler.
    /// Any error aborts the new connection.
    fn accept(&mut self, stack: &mut TcpStack, _listener: PcbId, new_pcb: PcbId) -> Result<()> {
        stack.abort(new_pcb)?;
        Err(Error::Abrt)
    }

    /// The PCB is gone. `pcb` is already stale when this runs.
    fn err(&mut self, _stack: &mut TcpStack, _pcb: PcbId, _err: Error) {}
}

/// Handler with lwIP's default behaviour: consume data, close on EOF,
/// refuse incoming connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl TcpHandler for NullHandler {}

/// IP layer below the engine
pub trait NetIf {
    /// Transmit one segment.
    fn output(&mut self, seg: &OutSegment<'_>) -> Result<()>;

    /// Local address to use towards `remote`, or `None` when unroutable.
    fn route(&mut self, remote: &IpAddr) -> Option<IpAddr>;
}

impl TcpStack {
    fn take_handler(&mut self, id: PcbId) -> Option<Option<Box<dyn TcpHandler>>> {
        match self.pcbs.get_mut(id)? {
            Pcb::Conn(pcb) => Some(pcb.handler.take()),
            Pcb::Listen(lpcb) => Some(lpcb.handler.take()),
        }
    }

    fn restore_handler(&mut self, id: PcbId, handler: Box<dyn TcpHandler>) {
        let slot = match self.pcbs.get_mut(id) {
            Some(Pcb::Conn(pcb)) => &mut pcb.handler,
            Some(Pcb::Listen(lpcb)) => &mut lpcb.handler,
            None => return,
        };
        if slot.is_none() {
            *slot = Some(handler);
        }
    }

    /// Run `f` against the handler of `id` (or the default handler when none
    /// is installed). `None` when `id` does not name a live PCB.
    pub(crate) fn dispatch<R>(
        &mut self,
        id: PcbId,
        f: impl FnOnce(&mut dyn TcpHandler, &mut TcpStack) -> R,
    ) -> Option<R> {
        match self.take_handler(id)? {
            Some(mut h) => {
                self.in_callback.push(id);
                let r = f(h.as_mut(), self);
                self.in_callback.pop();
                match self.pending_errs.iter().position(|&(p, _)| p == id) {
                    Some(pos) => {
                        let (_, err) = self.pending_errs.swap_remove(pos);
                        self.event_err(Some(h), id, err);
                    }
                    None => self.restore_handler(id, h),
                }
                Some(r)
            }
            None => Some(f(&mut NullHandler, self)),
        }
    }

    pub(crate) fn event_recv(&mut self, id: PcbId, data: Option<&[u8]>) -> Result<()> {
        self.dispatch(id, |h, stack| h.recv(stack, id, data)).unwrap_or(Err(Error::Abrt))
    }

    pub(crate) fn event_sent(&mut self, id: PcbId, len: u16) -> Result<()> {
        self.dispatch(id, |h, stack| h.sent(stack, id, len)).unwrap_or(Err(Error::Abrt))
    }

    pub(crate) fn event_connected(&mut self, id: PcbId) -> Result<()> {
        self.dispatch(id, |h, stack| h.connected(stack, id)).unwrap_or(Err(Error::Abrt))
    }

    pub(crate) fn event_poll(&mut self, id: PcbId) -> Result<()> {
        self.dispatch(id, |h, stack| h.poll(stack, id)).unwrap_or(Err(Error::Abrt))
    }

    pub(crate) fn event_accept(&mut self, listener: PcbId, new_pcb: PcbId) -> Result<()> {
        match self.dispatch(listener, |h, stack| h.accept(stack, listener, new_pcb)) {
            Some(r) => r,
            None => Err(Error::Val),
        }
    }

    /// Deliver `err` to a handler already detached from its (freed) PCB.
    /// A PCB freed from inside its own callback has no handler in the slot;
    /// the error is held until that callback returns.
    pub(crate) fn event_err(&mut self, handler: Option<Box<dyn TcpHandler>>, id: PcbId, err: Error) {
        match handler {
            Some(mut h) => {
                log::debug!("tcp: pcb {} err {}", id.index(), err);
                h.err(self, id, err);
            }
            None if self.in_callback.contains(&id) => {
                if !self.pending_errs.iter().any(|&(p, _)| p == id) {
                    self.pending_errs.push((id, err));
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Quiet;

    impl NetIf for Quiet {
        fn output(&mut self, _seg: &OutSegment<'_>) -> Result<()> {
            Ok(())
        }

        fn route(&mut self, _remote: &IpAddr) -> Option<IpAddr> {
            None
        }
    }

    struct Counting(Rc<RefCell<u32>>);

    impl TcpHandler for Counting {
        fn poll(&mut self, stack: &mut TcpStack, pcb: PcbId) -> Result<()> {
            *self.0.borrow_mut() += 1;
            // the handler is detached while it runs
            assert!(!stack.pcb(pcb).map(|p| p.has_handler()).unwrap_or(true));
            Ok(())
        }
    }

    #[test]
    fn handler_is_restored_after_dispatch() {
        let mut stack = TcpStack::new(TcpConfig::default(), Box::new(Quiet)).unwrap();
        let id = stack.new_pcb().unwrap();
        let hits = Rc::new(RefCell::new(0));
        stack.set_handler(id, Box::new(Counting(hits.clone()))).unwrap();

        assert_eq!(stack.event_poll(id), Ok(()));
        assert_eq!(*hits.borrow(), 1);
        assert!(stack.pcb(id).unwrap().has_handler());
    }

    #[test]
    fn dispatch_to_stale_handle() {
        let mut stack = TcpStack::new(TcpConfig::default(), Box::new(Quiet)).unwrap();
        let id = stack.new_pcb().unwrap();
        stack.close(id).unwrap();
        assert_eq!(stack.event_poll(id), Err(Error::Abrt));
    }
}
