//! Integration tests for RMPP transfers over the SA class.

mod common;

use common::*;
use ibmf::mad::{self, rmpp_status, RmppHdr, RmppType, METHOD_GET_TABLE, METHOD_GET_TABLE_RESP};
use ibmf::{ClientOptions, ClientType, RegFlags, RetransParams, TransStatus, TransportOpts};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn rmpp_of(frame: &ibmf::OutboundMad) -> RmppHdr {
    RmppHdr::from_mad(&frame.bytes).unwrap()
}

fn rmpp_client(h: &Harness, ty: ClientType) -> std::sync::Arc<ibmf::Client> {
    h.port
        .register(ty, ClientOptions::new().with_flags(RegFlags::RMPP))
        .unwrap()
}

#[test]
fn test_sender_windows_and_completes() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();
    let data = payload(450);

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x21), vec![0xcc; 20], data.clone()))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sa, &msg, TransportOpts::new().with_callback(done.callback()))
        .unwrap();

    // Window of one until the receiver speaks.
    assert_eq!(h.transport.sent_count(), 1);
    let first = rmpp_of(&h.transport.sent()[0]);
    assert_eq!(first.frame_type(), Some(RmppType::Data));
    assert!(first.is_first() && !first.is_last());
    assert_eq!(first.segnum, 1);
    assert_eq!(first.pyldlen_nwl, 450 + 3 * 20);

    h.deliver(&rmpp_ctrl(METHOD_GET_TABLE_RESP, 0x21, RmppType::Ack, 0, 1, 5)).unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(rmpp_of(&sent[1]).segnum, 2);
    let last = rmpp_of(&sent[2]);
    assert_eq!(last.segnum, 3);
    assert!(last.is_last());
    assert_eq!(last.pyldlen_nwl, 50 + 20);
    let (_, tail) = mad::split_mad(&sent[2].bytes);
    assert_eq!(&tail[..50], &data[400..]);
    assert_eq!(done.len(), 0);

    h.deliver(&rmpp_ctrl(METHOD_GET_TABLE_RESP, 0x21, RmppType::Ack, 0, 3, 7)).unwrap();
    assert_eq!(done.all(), vec![(0x21, TransStatus::Success)]);

    h.advance_ms(1_000);
    assert_eq!(h.transport.sent_count(), 3);
    assert_eq!(done.len(), 1);
}

#[test]
fn test_sender_resends_window_then_gives_up() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x22), vec![0; 20], payload(600)))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    let retrans = RetransParams {
        retries: Some(1),
        trans_to_us: 10_000_000,
        ..Default::default()
    };
    h.port
        .msg_transport(
            &sa,
            &msg,
            TransportOpts::new().with_retrans(retrans).with_callback(done.callback()),
        )
        .unwrap();
    assert_eq!(h.transport.sent_count(), 1);

    h.advance_ms(12);
    assert_eq!(h.transport.sent_count(), 2);
    assert_eq!(rmpp_of(&h.transport.sent()[1]).segnum, 1);

    h.advance_ms(12);
    let last = h.transport.last().unwrap();
    let abort = rmpp_of(&last);
    assert_eq!(abort.frame_type(), Some(RmppType::Abort));
    assert_eq!(abort.status, rmpp_status::TMR);
    assert_eq!(done.all(), vec![(0x22, TransStatus::TransTimeout)]);
    assert_eq!(sa.stats().timeouts, 1);
}

#[test]
fn test_sender_transaction_timer() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x23), vec![0; 20], payload(600)))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    let retrans = RetransParams {
        retries: Some(100),
        trans_to_us: 30_000,
        ..Default::default()
    };
    h.port
        .msg_transport(
            &sa,
            &msg,
            TransportOpts::new().with_retrans(retrans).with_callback(done.callback()),
        )
        .unwrap();

    h.run_for_ms(31);
    assert_eq!(done.all(), vec![(0x23, TransStatus::TransTimeout)]);
    let abort = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(abort.frame_type(), Some(RmppType::Abort));
    assert_eq!(abort.status, rmpp_status::T2L);

    let sent = h.transport.sent_count();
    h.advance_ms(1_000);
    assert_eq!(h.transport.sent_count(), sent);
}

#[test]
fn test_sender_ack_beyond_window_aborts() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x24), vec![0; 20], payload(600)))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sa, &msg, TransportOpts::new().with_callback(done.callback()))
        .unwrap();

    h.deliver(&rmpp_ctrl(METHOD_GET_TABLE_RESP, 0x24, RmppType::Ack, 0, 2, 5)).unwrap();
    let abort = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(abort.frame_type(), Some(RmppType::Abort));
    assert_eq!(abort.status, rmpp_status::S2B);
    assert_eq!(done.len(), 0);
    assert_eq!(sa.stats().rmpp_errors, 1);

    h.advance_ms(12);
    assert_eq!(done.all(), vec![(0x24, TransStatus::TransFailure)]);
}

#[test]
fn test_sender_stopped_by_receiver() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x25), vec![0; 20], payload(600)))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sa, &msg, TransportOpts::new().with_callback(done.callback()))
        .unwrap();

    h.deliver(&rmpp_ctrl(METHOD_GET_TABLE_RESP, 0x25, RmppType::Stop, rmpp_status::RESX, 0, 0))
        .unwrap();
    // No ABORT in answer to a STOP.
    assert_eq!(h.transport.sent_count(), 1);
    h.advance_ms(12);
    assert_eq!(done.all(), vec![(0x25, TransStatus::TransFailure)]);
}

#[test]
fn test_sender_bad_version_aborts() {
    let h = Harness::new(fast_config());
    let sa = rmpp_client(&h, ClientType::SubnAdmAgent);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sa).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE_RESP, 0x26), vec![0; 20], payload(600)))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sa, &msg, TransportOpts::new().with_callback(done.callback()))
        .unwrap();

    let mut ack = rmpp_ctrl(METHOD_GET_TABLE_RESP, 0x26, RmppType::Ack, 0, 1, 5);
    ack[mad::MAD_HDR_SIZE] = 2;
    h.deliver(&ack).unwrap();
    let abort = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(abort.status, rmpp_status::UNV);
    h.advance_ms(12);
    assert_eq!(done.statuses(), vec![TransStatus::TransFailure]);
}

/// An SA query answered by a three-segment GetTableResp.
#[test]
fn test_receiver_assembles_response() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();
    let data = payload(450);
    let cl_hdr = [0x3c; 20];

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE, 0x31), vec![0; 20], vec![1, 2, 3]))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();
    assert_eq!(h.transport.sent_count(), 1);

    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x31, &data, 1, &cl_hdr)).unwrap();
    let ack = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(ack.frame_type(), Some(RmppType::Ack));
    assert_eq!((ack.segnum, ack.pyldlen_nwl), (1, 6));

    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x31, &data, 2, &cl_hdr)).unwrap();
    assert_eq!(h.transport.sent_count(), 2);
    assert_eq!(done.len(), 0);

    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x31, &data, 3, &cl_hdr)).unwrap();
    let ack = rmpp_of(&h.transport.last().unwrap());
    assert_eq!((ack.segnum, ack.pyldlen_nwl), (3, 8));
    assert_eq!(done.all(), vec![(0x31, TransStatus::Success)]);

    let recv = msg.recv_bufs().unwrap();
    assert_eq!(recv.hdr.method, METHOD_GET_TABLE_RESP);
    assert_eq!(recv.cl_hdr, cl_hdr.to_vec());
    assert_eq!(recv.data, data);
    assert_eq!(sam.stats().recv_bufs_alloced, 1);

    // A termination context absorbs the duplicate last segment.
    assert_eq!(sam.registry_len(), 1);
    assert_eq!(sam.msgs_alloced(), 2);
    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x31, &data, 3, &cl_hdr)).unwrap();
    assert_eq!(h.transport.sent_count(), 4);
    assert_eq!(rmpp_of(&h.transport.last().unwrap()).segnum, 3);
    assert_eq!(done.len(), 1);

    h.advance_ms(12);
    assert_eq!(sam.registry_len(), 0);
    assert_eq!(sam.msgs_alloced(), 1);
    h.port.free_msg(&sam, msg).unwrap();
    h.port.unregister(&sam).unwrap();
}

#[test]
fn test_receiver_out_of_order_reacks() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();
    let data = payload(450);
    let cl_hdr = [0; 20];

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE, 0x32), vec![0; 20], Vec::new()))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();

    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x32, &data, 1, &cl_hdr)).unwrap();
    assert_eq!(h.transport.sent_count(), 2);
    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x32, &data, 3, &cl_hdr)).unwrap();
    let reack = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(reack.frame_type(), Some(RmppType::Ack));
    assert_eq!(reack.segnum, 1);

    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x32, &data, 2, &cl_hdr)).unwrap();
    h.deliver(&rmpp_data(METHOD_GET_TABLE_RESP, 0x32, &data, 3, &cl_hdr)).unwrap();
    assert_eq!(done.statuses(), vec![TransStatus::Success]);
    assert_eq!(msg.recv_bufs().unwrap().data, data);
}

#[test]
fn test_receiver_payload_overrun_aborts() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE, 0x33), vec![0; 20], Vec::new()))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();

    // Claims one packet of payload but does not mark it LAST.
    let rmpp = RmppHdr::new(RmppType::Data, mad::rmpp_flags::FIRST, 0, 1, 220);
    let seg = mad::build_mad(&sa_hdr(METHOD_GET_TABLE_RESP, 0x33), Some(&rmpp), &[0; 20], &[0; 200]);
    h.deliver(&seg).unwrap();

    let abort = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(abort.frame_type(), Some(RmppType::Abort));
    assert_eq!(abort.status, rmpp_status::ILPL);
    h.advance_ms(12);
    assert_eq!(done.statuses(), vec![TransStatus::TransFailure]);
    assert_eq!(sam.stats().rmpp_errors, 1);
}

#[test]
fn test_receiver_requires_first_flag() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE, 0x34), vec![0; 20], Vec::new()))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();

    let rmpp = RmppHdr::new(RmppType::Data, 0, 0, 1, 0);
    let seg = mad::build_mad(&sa_hdr(METHOD_GET_TABLE_RESP, 0x34), Some(&rmpp), &[0; 20], &[0; 200]);
    h.deliver(&seg).unwrap();
    assert_eq!(rmpp_of(&h.transport.last().unwrap()).status, rmpp_status::IFSN);
    h.advance_ms(12);
    assert_eq!(done.statuses(), vec![TransStatus::TransFailure]);
}

#[test]
fn test_receiver_unknown_length_grows() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();
    // Longer than the first buffer chunk of ten segments.
    let data = payload(2_450);
    let cl_hdr = [0; 20];

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(METHOD_GET_TABLE, 0x35), vec![0; 20], Vec::new()))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();

    let num_pkts = 13;
    for seg in 1..=num_pkts {
        let mut frame = rmpp_data(METHOD_GET_TABLE_RESP, 0x35, &data, seg, &cl_hdr);
        if seg == 1 {
            // Payload length left unspecified.
            frame[mad::MAD_HDR_SIZE + 8..mad::MAD_HDR_SIZE + 12].copy_from_slice(&0u32.to_be_bytes());
        }
        h.deliver(&frame).unwrap();
    }
    assert_eq!(done.statuses(), vec![TransStatus::Success]);
    assert_eq!(msg.recv_bufs().unwrap().data, data);
    assert_eq!(sam.stats().recv_bufs_alloced, 2);
}

/// A peer pushes an unsolicited multi-segment request to the SA.
#[test]
fn test_unsolicited_rmpp_request() {
    let h = Harness::new(fast_config());
    let inbox = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let sa = h
        .port
        .register(
            ClientType::SubnAdmAgent,
            ClientOptions::new()
                .with_flags(RegFlags::RMPP)
                .with_recv_callback(move |msg| sink.lock().push(msg)),
        )
        .unwrap();
    let data = payload(300);
    let cl_hdr = [0x11; 20];
    let method = mad::METHOD_SET;

    h.deliver(&rmpp_data(method, 0x41, &data, 1, &cl_hdr)).unwrap();
    assert!(inbox.lock().is_empty());
    h.deliver(&rmpp_data(method, 0x41, &data, 2, &cl_hdr)).unwrap();

    let msgs = inbox.lock().clone();
    assert_eq!(msgs.len(), 1);
    assert!(msgs[0].is_unsolicited());
    assert_eq!(msgs[0].recv_bufs().unwrap().data, data);

    // The sender switches direction; the termination context takes the ACK.
    h.deliver(&rmpp_ctrl(method, 0x41, RmppType::Ack, 0, 0, 1)).unwrap();
    assert_eq!(sa.registry_len(), 0);
    h.port.free_msg(&sa, msgs[0].clone()).unwrap();
    assert_eq!(sa.msgs_alloced(), 0);
}

#[test]
fn test_double_sided_sender_switches() {
    let h = Harness::new(fast_config());
    let sam = rmpp_client(&h, ClientType::SubnAdmManager);
    let done = Completions::new();
    let request = payload(300);
    let response = payload(250);
    let method = mad::METHOD_SET;

    let msg = h.port.alloc_msg(&sam).unwrap();
    msg.set_send(ibmf::MsgBufs::new(sa_hdr(method, 0x51), vec![0; 20], request))
        .unwrap();
    msg.set_addr(remote_addr(), None).unwrap();
    h.port
        .msg_transport(&sam, &msg, TransportOpts::new().sequenced().with_callback(done.callback()))
        .unwrap();
    h.deliver(&rmpp_ctrl(method, 0x51, RmppType::Ack, 0, 1, 5)).unwrap();
    assert_eq!(h.transport.sent_count(), 2);

    // Last segment acknowledged: switch and ACK(0, 1).
    h.deliver(&rmpp_ctrl(method, 0x51, RmppType::Ack, 0, 2, 6)).unwrap();
    let switch = rmpp_of(&h.transport.last().unwrap());
    assert_eq!(switch.frame_type(), Some(RmppType::Ack));
    assert_eq!((switch.segnum, switch.pyldlen_nwl), (0, 1));
    assert_eq!(done.len(), 0);

    // SA answers a Set with GetResp.
    let resp_method = mad::METHOD_GET_RESP;
    h.deliver(&rmpp_data(resp_method, 0x51, &response, 1, &[0; 20])).unwrap();
    h.deliver(&rmpp_data(resp_method, 0x51, &response, 2, &[0; 20])).unwrap();
    assert_eq!(done.statuses(), vec![TransStatus::Success]);
    assert_eq!(msg.recv_bufs().unwrap().data, response);
}
