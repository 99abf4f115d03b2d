mod common;

use common::*;
use embassy_time::Duration;
use relaybox_comms::{
    controller::{CrcPolicy, Status},
    frame::FunctionCode,
    Controller, Error, ErrorKind, Link, LinkShared,
};

fn controller() -> (Controller<'static, TestCfg>, &'static LinkShared) {
    let shared = leak_shared();
    let mut link = Link::new(shared, MockSerial::default());
    link.start().unwrap();
    (Controller::new(link), shared)
}

fn sent<'b>(con: &'b Controller<'static, TestCfg>) -> &'b [Vec<u8>] {
    &con.link().transport().sent
}

/// Issue a two register read of `0x07` and let it leave the wire
fn read_two(con: &mut Controller<'static, TestCfg>, shared: &LinkShared) {
    con.read_holding_registers(0x07, 0x0000, 2, at(0)).unwrap();
    shared.on_transmit_complete();
    assert_eq!(con.poll(at(1)), Status::Waiting);
}

#[test]
fn read_round_trip() {
    let (mut con, shared) = controller();
    con.read_holding_registers(0x07, 0x0000, 2, at(0)).unwrap();
    assert_eq!(sent(&con), &[sealed(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x02])]);
    let pending = *con.pending().unwrap();
    assert_eq!(pending.target, 0x07);
    assert_eq!(pending.expected_len, 9);

    assert_eq!(con.poll(at(1)), Status::Waiting);
    shared.on_transmit_complete();
    feed(shared, &sealed(&[0x07, 0x03, 0x04, 0x00, 0x07, 0x00, 0x03]), 2, at(4));

    assert_eq!(con.poll(at(5)), Status::Response(FunctionCode::ReadHoldingRegisters));
    assert_eq!(con.response_values(), &[7, 3]);
    assert_eq!(con.response_value(1), Some(3));
    assert_eq!(con.response_value(2), None);
    assert!(con.response_received());
    assert!(!con.response_received());
    assert!(con.pending().is_none());
    assert_eq!(con.poll(at(6)), Status::Idle);
}

#[test]
fn write_sends_staged_values() {
    let (mut con, shared) = controller();
    con.set_transmit_value(0, 0x0073).unwrap();
    con.set_transmit_value(1, 0x0009).unwrap();
    con.write_multiple_registers(0x07, 0x0002, 2, at(0)).unwrap();
    assert_eq!(
        sent(&con),
        &[sealed(&[0x07, 0x10, 0x00, 0x02, 0x00, 0x02, 0x04, 0x00, 0x73, 0x00, 0x09])]
    );

    shared.on_transmit_complete();
    feed(shared, &sealed(&[0x07, 0x10, 0x00, 0x02, 0x00, 0x02]), 8, at(3));
    assert_eq!(con.poll(at(3)), Status::Response(FunctionCode::WriteMultipleRegisters));
    assert!(con.response_received());
}

#[test]
fn one_request_at_a_time() {
    let (mut con, _) = controller();
    con.read_holding_registers(0x07, 0, 1, at(0)).unwrap();
    assert_eq!(con.read_holding_registers(0x07, 0, 1, at(0)), Err(Error::Busy));
    assert_eq!(sent(&con).len(), 1);
}

#[test]
fn buffer_limits() {
    let (mut con, _) = controller();
    assert_eq!(
        con.read_holding_registers(0x07, 0, 126, at(0)),
        Err(Error::Protocol(ErrorKind::Memory))
    );
    assert_eq!(
        con.read_holding_registers(0x07, 0, 0, at(0)),
        Err(Error::Protocol(ErrorKind::Range))
    );
    assert_eq!(con.set_transmit_value(124, 1), Ok(()));
    assert_eq!(con.set_transmit_value(125, 1), Err(ErrorKind::Range));
    // 125 values do not fit one frame
    assert_eq!(
        con.write_multiple_registers(0x07, 0, 125, at(0)),
        Err(Error::Protocol(ErrorKind::Memory))
    );
    assert!(sent(&con).is_empty());
    assert!(con.pending().is_none());
}

#[test]
fn response_timeout() {
    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    assert_eq!(con.poll(at(1000)), Status::Waiting);
    assert_eq!(con.poll(at(1001)), Status::Failed(ErrorKind::ResponseTimeout));
    assert!(con.pending().is_none());
    assert_eq!(con.poll(at(1002)), Status::Idle);

    con.set_response_interval(Duration::from_millis(50));
    assert_eq!(con.response_interval(), Duration::from_millis(50));
    read_two(&mut con, shared);
    assert_eq!(con.poll(at(51)), Status::Failed(ErrorKind::ResponseTimeout));
}

#[test]
fn response_from_the_wrong_device() {
    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    feed(shared, &sealed(&[0x08, 0x03, 0x04, 0x00, 0x07, 0x00, 0x03]), 9, at(2));
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::SlaveIdMismatch));
    assert!(!con.response_received());
}

#[test]
fn response_with_the_wrong_function() {
    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    feed(shared, &sealed(&[0x07, 0x04, 0x04, 0x00, 0x07, 0x00, 0x03]), 9, at(2));
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::FunctionMismatch));
}

#[test]
fn exception_responses() {
    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    feed(shared, &sealed(&[0x07, 0x83, 0x02]), 5, at(2));
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::IllegalDataAddress));

    read_two(&mut con, shared);
    feed(shared, &sealed(&[0x07, 0x83, 0x09]), 1, at(2));
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::IllegalFunction));
}

#[test]
fn checksum_policy() {
    let mut bad = sealed(&[0x07, 0x03, 0x04, 0x00, 0x07, 0x00, 0x03]);
    bad[8] ^= 0x80;

    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    feed(shared, &bad, 9, at(2));
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::InvalidCrc));

    con.set_crc_policy(CrcPolicy::Skip);
    read_two(&mut con, shared);
    feed(shared, &bad, 9, at(2));
    assert_eq!(con.poll(at(2)), Status::Response(FunctionCode::ReadHoldingRegisters));
    assert_eq!(con.response_values(), &[7, 3]);
}

#[test]
fn late_transmission_is_retried() {
    let (mut con, _) = controller();
    con.set_transmit_timeout(Duration::from_millis(10));
    con.set_transmit_retries(2);
    con.read_holding_registers(0x07, 0, 1, at(0)).unwrap();

    assert_eq!(con.poll(at(10)), Status::Waiting);
    assert_eq!(con.poll(at(11)), Status::Waiting);
    assert_eq!(sent(&con).len(), 2);
    assert_eq!(con.poll(at(22)), Status::Waiting);
    assert_eq!(sent(&con).len(), 3);
    assert_eq!(con.poll(at(33)), Status::Failed(ErrorKind::TransmitTimeout));
    assert!(con.pending().is_none());
    assert_eq!(con.poll(at(34)), Status::Idle);
}

#[test]
fn transport_fault_fails_the_pending_request() {
    let (mut con, shared) = controller();
    read_two(&mut con, shared);
    shared.on_error();
    assert_eq!(con.poll(at(2)), Status::Failed(ErrorKind::Transport));
    assert!(con.pending().is_none());
    assert_eq!(con.link().transport().resets.len(), 2);
}

#[test]
fn unsolicited_frames_are_discarded() {
    let (mut con, shared) = controller();
    feed(shared, &sealed(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01]), 8, at(0));
    assert_eq!(con.poll(at(0)), Status::Idle);

    read_two(&mut con, shared);
    feed(shared, &sealed(&[0x07, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]), 9, at(2));
    assert_eq!(con.poll(at(2)), Status::Response(FunctionCode::ReadHoldingRegisters));
    assert_eq!(con.response_values(), &[1, 2]);
}
