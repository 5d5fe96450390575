//! Integration tests for data transfer, closing and error paths


use assert_matches::assert_matches;
use test_helpers::*;
use tcp_engine::{Error, PcbList, TcpFlags, TcpState};

// ============================================================================
// Receiving
// ============================================================================

#[test]
fn test_delayed_ack() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.input(&conn.from_peer(TcpFlags::ACK | TcpFlags::PSH, b"hello"));
    assert_eq!(h.ev.borrow().recved, b"hello");
    // ACK is delayed until the fast timer
    assert_eq!(h.tx_count(), 0);

    h.stack.tmr();
    let ack = h.last_tx().unwrap();
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!(ack.ackno, PEER_ISS + 6);
    assert_eq!(ack.seqno, conn.snd_nxt);
    assert_eq!(h.tx_count(), 1);
}

#[test]
fn test_second_segment_acked_immediately() {
    let mut h = Harness::new();
    let mut conn = establish_active(&mut h);

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"abc"));
    conn.rcv_nxt += 3;
    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"def"));

    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].ackno, PEER_ISS + 7);
}

#[test]
fn test_out_of_order_reassembly() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 5, conn.snd_nxt, TcpFlags::ACK, b"efgh"));
    let dup = h.take_tx();
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].ackno, PEER_ISS + 1);
    assert_eq!(h.stack.segs_in_use(), 1);
    assert_eq!(h.ev.borrow().recv_calls, 0);

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"abcd"));
    let ev = h.ev.borrow();
    assert_eq!(ev.recv_calls, 1);
    assert_eq!(ev.recved, b"abcdefgh");
    assert_eq!(h.stack.segs_in_use(), 0);
    assert_eq!(h.stack.pcb(conn.id).unwrap().rod.rcv_nxt, PEER_ISS + 9);
}

#[test]
fn test_retransmitted_data_is_reacked() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"abcd"));
    h.stack.tmr();
    h.take_tx();

    // same segment again: nothing new, but the peer needs to hear it
    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"abcd"));
    let ack = h.last_tx().unwrap();
    assert_eq!(ack.ackno, PEER_ISS + 5);
    assert_eq!(h.ev.borrow().recved, b"abcd");
}

#[test]
fn test_refused_data_is_offered_again() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().refuse_recv = true;

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"later"));
    assert!(h.stack.pcb(conn.id).unwrap().rod.refused_data.is_some());
    assert_eq!(h.ev.borrow().recv_calls, 0);

    // still refused: kept
    h.stack.tmr();
    assert!(h.stack.pcb(conn.id).unwrap().rod.refused_data.is_some());

    h.ev.borrow_mut().refuse_recv = false;
    h.stack.tmr();
    assert!(h.stack.pcb(conn.id).unwrap().rod.refused_data.is_none());
    assert_eq!(h.ev.borrow().recved, b"later");
}

#[test]
fn test_txnow_flushes_failed_ack() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.tx.borrow_mut().fail_output = true;

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 10, conn.snd_nxt, TcpFlags::ACK, b"gap"));
    let flags = h.stack.pcb(conn.id).unwrap().conn_mgmt.flags;
    assert!(flags.contains(tcp_engine::PcbFlags::ACK_NOW));
    assert_eq!(h.tx_count(), 0);

    h.tx.borrow_mut().fail_output = false;
    h.stack.txnow();
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].ackno, PEER_ISS + 1);
}

// ============================================================================
// Sending
// ============================================================================

#[test]
fn test_write_and_ack() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    let snd_buf = h.stack.sndbuf(conn.id).unwrap();

    h.stack.write(conn.id, b"data").unwrap();
    assert_eq!(h.stack.sndbuf(conn.id), Ok(snd_buf - 4));
    // queued only
    assert_eq!(h.tx_count(), 0);

    h.stack.output(conn.id).unwrap();
    let seg = h.take_tx().remove(0);
    assert_eq!(seg.payload, b"data");
    assert_eq!(seg.seqno, conn.snd_nxt);
    assert!(seg.flags.contains(TcpFlags::ACK | TcpFlags::PSH));

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 4, TcpFlags::ACK, &[]));
    assert_eq!(h.ev.borrow().sent_bytes, 4);
    assert_eq!(h.stack.sndbuf(conn.id), Ok(snd_buf));
    assert!(h.stack.pcb(conn.id).unwrap().rod.unacked.is_empty());
    assert_eq!(h.stack.segs_in_use(), 0);
}

#[test]
fn test_write_splits_at_mss() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.write(conn.id, &[7u8; 1000]).unwrap();
    h.stack.output(conn.id).unwrap();
    let tx = h.take_tx();
    assert_eq!(tx.len(), 2);
    assert_eq!(tx[0].payload.len(), 536);
    assert_eq!(tx[1].payload.len(), 464);
    assert_eq!(tx[1].seqno, conn.snd_nxt + 536);
    assert!(!tx[0].flags.contains(TcpFlags::PSH));
    assert!(tx[1].flags.contains(TcpFlags::PSH));
}

#[test]
fn test_write_limits() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    let snd_buf = usize::from(h.stack.sndbuf(conn.id).unwrap());

    assert_eq!(h.stack.write(conn.id, &vec![0u8; snd_buf + 1]), Err(Error::Mem));
    assert_eq!(h.stack.write(conn.id, &[]), Ok(()));

    let l = h.stack.new_pcb().unwrap();
    h.stack.bind(l, TEST_LOCAL_IP, 80).unwrap();
    h.stack.listen(l).unwrap();
    assert_eq!(h.stack.write(l, b"x"), Err(Error::Conn));
}

#[test]
fn test_fast_retransmit() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    let dupack = conn.from_peer(TcpFlags::ACK, &[]);
    // settle the window bookkeeping first; this one is a window update
    h.stack.input(&dupack);

    h.stack.write(conn.id, &[1u8; 1000]).unwrap();
    h.stack.output(conn.id).unwrap();
    assert_eq!(h.take_tx().len(), 2);

    h.stack.input(&dupack);
    h.stack.input(&dupack);
    assert_eq!(h.tx_count(), 0);

    h.stack.input(&dupack);
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].seqno, conn.snd_nxt);
    assert_eq!(tx[0].payload.len(), 536);
    let pcb = h.stack.pcb(conn.id).unwrap();
    assert!(pcb.conn_mgmt.flags.contains(tcp_engine::PcbFlags::INFR));
}

// ============================================================================
// Closing
// ============================================================================

#[test]
fn test_active_close() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.close(conn.id).unwrap();
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::FinWait1));
    let fin = h.take_tx().remove(0);
    assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin.seqno, conn.snd_nxt);

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 1, TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::FinWait2));

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 1, conn.snd_nxt + 1, TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
    assert_eq!(h.stack.list_of(conn.id), Some(PcbList::TimeWait));
    let ack = h.last_tx().unwrap();
    assert_eq!(ack.ackno, PEER_ISS + 2);
    assert!(h.errs().is_empty());
    assert!(h.stack.pcbs_sane());
}

#[test]
fn test_passive_close() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().close_on_eof = true;

    h.stack.input(&conn.from_peer(TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.ev.borrow().eof_calls, 1);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::LastAck));

    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(tx[0].ackno, PEER_ISS + 2);

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 2, conn.snd_nxt + 1, TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert!(h.errs().is_empty());
    assert_eq!(h.stack.counts().total, 0);
}

#[test]
fn test_peer_close_without_app_close() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.input(&conn.from_peer(TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::CloseWait));
    assert_eq!(h.last_tx().unwrap().ackno, PEER_ISS + 2);

    // half-closed: we may still send
    h.stack.write(conn.id, b"bye").unwrap();
    h.stack.output(conn.id).unwrap();
    assert_eq!(h.last_tx().unwrap().payload, b"bye");
}

#[test]
fn test_simultaneous_close() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.close(conn.id).unwrap();
    h.take_tx();

    // peer's FIN crosses ours
    h.stack.input(&conn.from_peer(TcpFlags::FIN | TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Closing));
    assert_eq!(h.last_tx().unwrap().ackno, PEER_ISS + 2);

    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 2, conn.snd_nxt + 1, TcpFlags::ACK, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
}

#[test]
fn test_close_with_unread_data_resets() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().hold_window = true;

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"hello"));
    h.take_tx();

    h.stack.close(conn.id).unwrap();
    let rst = h.last_tx().unwrap();
    assert!(is_rst(&rst));
    assert_eq!(rst.seqno, conn.snd_nxt);
    assert_eq!(rst.ackno, PEER_ISS + 6);
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
    assert!(h.errs().is_empty());
}

#[test]
fn test_shutdown_tx_keeps_receiving() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.shutdown(conn.id, false, true).unwrap();
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::FinWait1));
    assert!(is_fin(&h.take_tx()[0]));

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"more"));
    assert_eq!(h.ev.borrow().recved, b"more");
}

#[test]
fn test_data_after_shutdown_rx_aborts() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.shutdown(conn.id, true, false).unwrap();
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Established));

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"ignored"));
    assert!(is_rst(&h.last_tx().unwrap()));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
}

#[test]
fn test_shutdown_errors() {
    let mut h = Harness::new();
    let l = listener(&mut h);
    assert_eq!(h.stack.shutdown(l, false, true), Err(Error::Conn));

    let id = h.stack.new_pcb().unwrap();
    h.stack.connect(id, TEST_REMOTE_IP, TEST_REMOTE_PORT).unwrap();
    // SYN_SENT: nothing to shut down yet
    assert_eq!(h.stack.shutdown(id, false, true), Err(Error::Conn));
    assert_eq!(h.stack.state(id), Ok(TcpState::SynSent));
}

#[test]
fn test_close_listener_and_unconnected() {
    let mut h = Harness::new();
    let l = listener(&mut h);
    h.stack.close(l).unwrap();
    assert_eq!(h.stack.state(l), Err(Error::Arg));

    let id = h.stack.new_pcb().unwrap();
    h.stack.bind(id, TEST_LOCAL_IP, 80).unwrap();
    h.stack.close(id).unwrap();
    assert_eq!(h.stack.counts().total, 0);
    assert_eq!(h.tx_count(), 0);
}

#[test]
fn test_close_in_syn_sent() {
    let mut h = Harness::new();
    let id = h.stack.new_pcb().unwrap();
    h.stack.set_handler(id, h.recorder()).unwrap();
    h.stack.connect(id, TEST_REMOTE_IP, TEST_REMOTE_PORT).unwrap();
    h.take_tx();

    h.stack.close(id).unwrap();
    assert_eq!(h.stack.state(id), Err(Error::Arg));
    assert_eq!(h.stack.segs_in_use(), 0);
    assert_eq!(h.tx_count(), 0);
    assert!(h.errs().is_empty());
}

// ============================================================================
// Resets and aborts
// ============================================================================

#[test]
fn test_rst_in_established() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    // outside the window: ignored
    h.stack.input(&seg_to(conn.local_port, PEER_ISS + 50000, 0, TcpFlags::RST, &[]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::Established));

    h.stack.input(&conn.from_peer(TcpFlags::RST, &[]));
    assert_eq!(h.errs(), vec![Error::Rst]);
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert_eq!(h.tx_count(), 0);
}

#[test]
fn test_abort() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);

    h.stack.abort(conn.id).unwrap();
    let rst = h.last_tx().unwrap();
    assert!(is_rst(&rst));
    assert_eq!(rst.seqno, conn.snd_nxt);
    assert_eq!(rst.ackno, PEER_ISS + 1);
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert!(h.stack.pcbs_sane());
}

#[test]
fn test_abandon_unconnected_sends_nothing() {
    let mut h = Harness::new();
    let id = h.stack.new_pcb().unwrap();
    h.stack.set_handler(id, h.recorder()).unwrap();
    h.stack.bind(id, TEST_LOCAL_IP, 80).unwrap();

    h.stack.abandon(id, true).unwrap();
    assert_eq!(h.tx_count(), 0);
    assert_eq!(h.errs(), vec![Error::Abrt]);
}

#[test]
fn test_stale_handles() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.stack.abort(conn.id).unwrap();

    assert_eq!(h.stack.write(conn.id, b"x"), Err(Error::Arg));
    assert_eq!(h.stack.close(conn.id), Err(Error::Arg));
    assert_eq!(h.stack.abort(conn.id), Err(Error::Arg));
    assert_eq!(h.stack.recved(conn.id, 1), Err(Error::Arg));
    assert_matches!(h.stack.bind(conn.id, TEST_LOCAL_IP, 80), Err(Error::Arg));

    // the slot is reused under a new handle
    let fresh = h.stack.new_pcb().unwrap();
    assert_eq!(fresh.index(), conn.id.index());
    assert_ne!(fresh, conn.id);
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
}

#[test]
fn test_address_change() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    let l = h.stack.new_pcb().unwrap();
    h.stack.bind(l, TEST_LOCAL_IP, 80).unwrap();
    h.stack.listen(l).unwrap();

    let new_ip: std::net::IpAddr = "192.168.0.9".parse().unwrap();
    h.stack.netif_ip_addr_changed(TEST_LOCAL_IP, Some(new_ip));

    assert!(is_rst(&h.last_tx().unwrap()));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert_eq!(h.stack.listener(l).unwrap().local_ip, new_ip);
}

#[test]
fn test_close_with_refused_data_resets_once() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().refuse_recv = true;

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"unwanted"));
    assert!(h.stack.pcb(conn.id).unwrap().rod.refused_data.is_some());
    h.take_tx();

    h.stack.close(conn.id).unwrap();
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert!(is_rst(&tx[0]));
    assert!(!is_fin(&tx[0]));
    assert_eq!(h.stack.state(conn.id), Ok(TcpState::TimeWait));
    assert!(h.stack.pcb(conn.id).unwrap().rod.refused_data.is_none());
}

#[test]
fn test_abort_inside_recv_reports_abrt() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    h.ev.borrow_mut().abort_on_recv = true;

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"bye"));
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    assert!(is_rst(&h.last_tx().unwrap()));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert!(h.stack.pcbs_sane());
}

#[test]
fn test_close_on_eof_with_unread_data_reports_abrt() {
    let mut h = Harness::new();
    let conn = establish_active(&mut h);
    {
        let mut ev = h.ev.borrow_mut();
        ev.hold_window = true;
        ev.close_on_eof = true;
    }

    h.stack.input(&conn.from_peer(TcpFlags::ACK, b"hello"));
    h.take_tx();
    let fin = seg_to(conn.local_port, PEER_ISS + 6, conn.snd_nxt, TcpFlags::FIN | TcpFlags::ACK, &[]);
    h.stack.input(&fin);

    // CLOSE_WAIT with data the application never took: reset and freed
    assert_eq!(h.stack.state(conn.id), Err(Error::Arg));
    let tx = h.take_tx();
    assert_eq!(tx.len(), 1);
    assert!(is_rst(&tx[0]));
    assert_eq!(h.errs(), vec![Error::Abrt]);
    assert_eq!(h.stack.counts().total, 0);
}
