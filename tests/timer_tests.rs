//! Integration tests for the fast and slow timers


use std::cell::RefCell;
use std::rc::Rc;

use test_helpers::*;
use tcp_engine::{Error, KeepAlive, PcbId, Result, SocketOptions, TcpConfig, TcpFlags, TcpHandler, TcpStack, TcpState};

/// Slow ticks (1-based) at which something was transmitted, over `n` ticks.
fn tx_ticks(h: &mut Harness, n: u32) -> Vec<u32> {
    let mut at = Vec::new();
    for tick in 1..=n {
        h.slow_tick();
        if !h.take_tx().is_empty() {
            at.push(tick);
        }
    }
    at
}

// ============================================================================
// Retransmission
// ============================================================================

#[test]
fn test_rto_backoff() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.write(conn.id, b"data").unwrap();
    h.stack.output(conn.id).unwrap();
    h.take_tx();

    let mut at = Vec::new();
    for tick in 1..=66 {
        h.slow_tick();
        for seg in h.take_tx() {
            assert_eq!(seg.seqno, conn.snd_nxt);
            assert_eq!(seg.payload, b"data");
            at.push(tick);
        }
    }
    assert_eq!(at, vec![6, 12, 24, 42, 66]);

    let pcb = h.stack.pcb(conn.id).unwrap();
    assert_eq!(pcb.rod.nrtx, 5);
    assert_eq!(pcb.cong_ctrl.cwnd, 536);
}

#[test]
fn test_ack_resets_backoff() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.write(conn.id, b"data").unwrap();
    h.stack.output(conn.id).unwrap();
    h.slow_ticks(12);
    assert_eq!(h.stack.pcb(conn.id).unwrap().rod.nrtx, 2);

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 4, TcpFlags::ACK, &[]));
    let pcb = h.stack.pcb(conn.id).unwrap();
    assert_eq!(pcb.rod.nrtx, 0);
    assert_eq!(pcb.rod.rtime, -1);
    assert_eq!(pcb.rod.rto, pcb.rod.rto_base());
}

#[test]
fn test_data_retries_give_up() {
    let cfg = TcpConfig { max_rtx: 3, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let conn = establish_active(&mut h);
    h.stack.write(conn.id, b"data").unwrap();
    h.stack.output(conn.id).unwrap();
    h.take_tx();

    assert_eq!(tx_ticks(&mut h, 24), vec![6, 12, 24]);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Established));

    h.slow_tick();
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    // given up quietly
    assert_eq!(h.tx_count(), 0);
    assert_eq!(h.stack.segs_in_use(), 0);
}

#[test]
fn test_syn_retries_give_up() {
    let mut h = Harness::new();
    let id = h.stack.new_pcb().unwrap();
    h.stack.set_handler(id, h.recorder()).unwrap();
    h.stack.connect(id, TEST_REMOTE_IP, TEST_REMOTE_PORT).unwrap();
    let syn = h.take_tx().remove(0);

    let mut at = Vec::new();
    for tick in 1..=36 {
        h.slow_tick();
        for seg in h.take_tx() {
            assert!(is_syn(&seg));
            assert_eq!(seg.seqno, syn.seqno);
            at.push(tick);
        }
    }
    // no backoff for SYNs
    assert_eq!(at, vec![6, 12, 18, 24, 30, 36]);

    h.slow_tick();
    assert_eq!(h.stack.state(id), Err(Error::Arg));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert_eq!(h.tx_count(), 0);
}

// ============================================================================
// Persist
// ============================================================================

#[test]
fn test_zero_window_probes() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    let mut closed = conn.from_peer(TcpFlags::ACK, &[]);
    closed.wnd = 0;
    h.stack.input(&closed);
    h.stack.write(conn.id, b"0123456789").unwrap();
    h.stack.output(conn.id).unwrap();
    assert_eq!(h.tx_count(), 0);
    assert_eq!(h.stack.pcb(conn.id).unwrap().flow_ctrl.persist_backoff, 1);

    let mut at = Vec::new();
    for tick in 1..=429 {
        h.slow_tick();
        for seg in h.take_tx() {
            assert_eq!(seg.payload, b"0");
            assert_eq!(seg.seqno, conn.snd_nxt);
            at.push(tick);
        }
    }
    assert_eq!(at, vec![3, 9, 21, 45, 93, 189, 309, 429]);
    assert_eq!(h.stack.pcb(conn.id).unwrap().flow_ctrl.persist_backoff, 7);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Established));

    // window opens again
    h.stack.input(&conn.from_peer(TcpFlags::ACK, &[]));
    assert_eq!(h.stack.pcb(conn.id).unwrap().flow_ctrl.persist_backoff, 0);
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].payload, b"0123456789");
    assert_eq!(tx[0].seqno, conn.snd_nxt);
}

// ============================================================================
// Keepalive
// ============================================================================

#[test]
fn test_keepalive_probes_then_reset() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.set_so_options(conn.id, SocketOptions::KEEPALIVE).unwrap();
    h.stack.set_keepalive(conn.id, KeepAlive { idle_ms: 2000, intvl_ms: 1000, cnt: 2 }).unwrap();
    assert_eq!(h.stack.keepalive_params(conn.id).unwrap().cnt, 2);

    let mut probes = Vec::new();
    for tick in 1..=8 {
        h.slow_tick();
        for seg in h.take_tx() {
            assert_eq!(seg.flags, TcpFlags::ACK);
            assert_eq!(seg.seqno, conn.snd_nxt - 1);
            assert!(seg.payload.is_empty());
            probes.push(tick);
        }
    }
    assert_eq!(probes, vec![5, 7]);
    assert!(h.errs().is_empty());

    h.slow_tick();
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert!(is_rst(&tx[0]));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
}

#[test]
fn test_keepalive_answer_restarts_idle() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.set_so_options(conn.id, SocketOptions::KEEPALIVE).unwrap();
    h.stack.set_keepalive(conn.id, KeepAlive { idle_ms: 2000, intvl_ms: 1000, cnt: 2 }).unwrap();

    h.slow_ticks(5);
    assert_eq!(h.take_tx().len(), 1);
    assert_eq!(h.stack.pcb(conn.id).unwrap().conn_mgmt.keep_cnt_sent, 1);

    h.stack.input(&conn.from_peer(TcpFlags::ACK, &[]));
    assert_eq!(h.stack.pcb(conn.id).unwrap().conn_mgmt.keep_cnt_sent, 0);

    h.slow_ticks(8);
    assert!(h.errs().is_empty());
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Established));
}

// ============================================================================
// Per-state timeouts
// ============================================================================

#[test]
fn test_syn_rcvd_timeout() {
    let cfg = TcpConfig { syn_rcvd_timeout_ms: 5000, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let l = listener(&mut h);
    h.stack.input(&remote_seg(PEER_ISS, 0, TcpFlags::SYN, &[]));
    h.take_tx();
    assert_eq!(h.stack.listener(l).unwrap().accepts_pending, 1);

    // the SYN|ACK is retransmitted once on the way
    assert_eq!(tx_ticks(&mut h, 10), vec![6]);
    assert_eq!(h.stack.counts().active, 1);

    h.slow_tick();
    assert_eq!(h.stack.counts().active, 0);
    assert_eq!(h.stack.listener(l).unwrap().accepts_pending, 0);
    assert_eq!(h.tx_count(), 0);
    assert!(h.ev.borrow().accepted.is_empty());
}

#[test]
fn test_last_ack_timeout() {
    let cfg = TcpConfig { msl_ms: 1000, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().close_on_eof = true;
    h.stack.input(&conn.from_peer(TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::LastAck));

    h.slow_ticks(4);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::LastAck));
    h.slow_tick();
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert_eq!(h.errs(), vec![Error::Abrt]);
}

#[test]
fn test_fin_wait_2_timeout() {
    let cfg = TcpConfig { fin_wait_timeout_ms: 2000, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let conn = establish_active(&mut h);
    h.stack.close(conn.id).unwrap();
    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 1, TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::FinWait2));

    h.slow_ticks(4);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::FinWait2));
    h.slow_tick();
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert_eq!(h.errs(), vec![Error::Abrt]);
}

#[test]
fn test_time_wait_expires() {
    let cfg = TcpConfig { msl_ms: 1000, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let conn = establish_active(&mut h);
    h.stack.close(conn.id).unwrap();
    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 1, TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
    h.take_tx();

    h.slow_ticks(4);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
    h.slow_tick();
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert!(h.errs().is_empty());
    assert_eq!(h.tx_count(), 0);
    assert_eq!(h.stack.counts().total, 0);
}

#[test]
fn test_ooseq_dropped_after_timeout() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 5, conn.snd_nxt, TcpFlags::ACK, b"late"));
    assert_eq!(h.stack.segs_in_use(), 1);

    // ooseq_timeout * rto = 6 * 6 slow ticks
    h.slow_ticks(35);
    assert_eq!(h.stack.segs_in_use(), 1);
    h.slow_tick();
    assert_eq!(h.stack.segs_in_use(), 0);
    assert!(h.stack.pcb(conn.id).unwrap().rod.ooseq.is_empty());
}

// ============================================================================
// Poll and list changes during the walk
// ============================================================================

#[test]
fn test_poll_interval() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.poll(conn.id, 2).unwrap();

    h.slow_ticks(6);
    assert_eq!(h.ev.borrow().poll_calls, 3);
}

/// Aborts its own connection on the first poll
/// Aborts its own connection from the poll callback
struct AbortOnPoll(Rc<RefCell<Events>>);

impl TcpHandler for AbortOnPoll {
    fn poll(&mut self, stack: &mut TcpStack, pcb: PcbId) -> Result<()> {
        stack.abort(pcb)?;
        Err(Error::Abrt)
    }

    fn err(&mut self, _stack: &mut TcpStack, _pcb: PcbId, err: Error) {
        self.0.borrow_mut().errs.push(err);
    }
}

#[test]
fn test_abort_from_poll_keeps_walk_going() {
    let mut h = Harness::new();
    let a = establish_active_on(&mut h, 0x101);
    let b = establish_active_on(&mut h, 0x102);
    h.stack.set_handler(a.id, Box::new(AbortOnPoll(h.ev.clone()))).unwrap();

    h.slow_tick();
    assert_eq!(h.stack.state(a.id), Err(Error::Arg));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert!(is_rst(&h.last_tx().unwrap()));
    assert_eq!(h.stack.state(b.id), Ok(TcpState::Established));
    // b is polled exactly once even though the walk restarted
    assert_eq!(h.ev.borrow().poll_calls, 1);
    assert!(h.stack.pcbs_sane());
}

#[test]
fn test_ticks_advance_on_odd_calls() {
    let mut h = Harness::new();
    assert_eq!(h.stack.ticks(), 0);
    h.stack.tmr();
    assert_eq!(h.stack.ticks(), 1);
    h.stack.tmr();
    assert_eq!(h.stack.ticks(), 1);
    h.stack.tmr();
    assert_eq!(h.stack.ticks(), 2);
}
