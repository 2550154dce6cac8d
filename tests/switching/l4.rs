//! TCP and UDP endpoints on the switch's own addresses

use super::harness::*;
use std::time::{Duration, Instant};
use vswitch::dataplane::FlowKey;
use vswitch::protocol::ethernet::EthernetPacket;
use vswitch::protocol::tcp::{TcpFlags, TcpOption};

const LOCAL: &str = "10.0.0.1";
const HOST: &str = "10.0.0.10";

fn lab() -> Lab {
    let mut lab = Lab::new();
    lab.network(1, "10.0.0.0/24", None);
    lab.ip(1, LOCAL, mac(1));
    lab.port("p1", 1);
    lab.send("p1", &arp_request(mac(10), HOST, LOCAL));
    lab.clear();
    lab
}

fn segment(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> EthernetPacket {
    let mut tcp = tcp_segment(sock("10.0.0.10:40000"), sock("10.0.0.1:80"), seq, ack, flags);
    tcp.payload = payload.to_vec();
    super::harness::tcp(mac(10), mac(1), tcp, HOST, LOCAL)
}

/// Complete a handshake with a listener on :80; returns the flow and the
/// switch's next sequence number
fn connect(lab: &Lab) -> (FlowKey, u32) {
    lab.switch.listen_tcp(1, sock("10.0.0.1:80")).unwrap();
    lab.send("p1", &segment(1000, 0, TcpFlags::SYN, b""));
    let out = lab.take("p1");
    let syn_ack = tcp_of(&out[0]);
    let isn = syn_ack.seq;

    lab.send("p1", &segment(1001, isn.wrapping_add(1), TcpFlags::ACK, b""));
    let key = lab
        .switch
        .accept(1, sock("10.0.0.1:80"))
        .unwrap()
        .expect("handshake completed");
    (key, isn.wrapping_add(1))
}

#[test]
fn test_handshake() {
    let lab = lab();
    lab.switch.listen_tcp(1, sock("10.0.0.1:80")).unwrap();
    lab.send("p1", &segment(1000, 0, TcpFlags::SYN, b""));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    let syn_ack = tcp_of(&out[0]);
    assert!(syn_ack.flags.is_syn_ack());
    assert_eq!(syn_ack.ack, 1001);
    assert!(syn_ack.options.iter().any(|o| matches!(o, TcpOption::Mss(_))));
    // not established yet
    assert_eq!(lab.switch.accept(1, sock("10.0.0.1:80")).unwrap(), None);

    lab.send("p1", &segment(1001, syn_ack.seq.wrapping_add(1), TcpFlags::ACK, b""));
    assert!(lab.take("p1").is_empty());
    let key = lab.switch.accept(1, sock("10.0.0.1:80")).unwrap().unwrap();
    assert_eq!(key.remote, sock("10.0.0.10:40000"));
    assert_eq!(key.local, sock("10.0.0.1:80"));
    assert_eq!(lab.switch.accept(1, sock("10.0.0.1:80")).unwrap(), None);
}

#[test]
fn test_receive_with_delayed_ack() {
    let lab = lab();
    let (key, next) = connect(&lab);

    lab.send("p1", &segment(1001, next, TcpFlags::PSH_ACK, b"hello"));
    // acknowledged later
    assert!(lab.take("p1").is_empty());
    assert_eq!(lab.switch.tcp_read(1, &key, 1024).unwrap(), b"hello");
    assert!(lab.switch.tcp_read(1, &key, 1024).unwrap().is_empty());

    lab.switch.tick(Instant::now() + Duration::from_millis(100));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let ack = tcp_of(&out[0]);
    assert!(ack.flags.ack && !ack.flags.psh);
    assert_eq!(ack.ack, 1006);
}

#[test]
fn test_out_of_order_data_reassembled() {
    let lab = lab();
    let (key, next) = connect(&lab);

    lab.send("p1", &segment(1004, next, TcpFlags::PSH_ACK, b"lo"));
    // the gap is reported straight away
    let dup_ack = lab.take("p1");
    assert_eq!(tcp_of(&dup_ack[0]).ack, 1001);
    assert!(lab.switch.tcp_read(1, &key, 1024).unwrap().is_empty());

    lab.send("p1", &segment(1001, next, TcpFlags::PSH_ACK, b"hel"));
    assert_eq!(lab.switch.tcp_read(1, &key, 1024).unwrap(), b"hello");
}

#[test]
fn test_send_and_close() {
    let lab = lab();
    let (key, next) = connect(&lab);

    assert_eq!(lab.switch.tcp_write(1, &key, b"world").unwrap(), 5);
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let data = tcp_of(&out[0]);
    assert_eq!(data.flags, TcpFlags::PSH_ACK);
    assert_eq!(data.seq, next);
    assert_eq!(data.ack, 1001);
    assert_eq!(data.payload, b"world");

    lab.switch.tcp_close(1, &key).unwrap();
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let fin = tcp_of(&out[0]);
    assert_eq!(fin.flags, TcpFlags::FIN_ACK);
    assert_eq!(fin.seq, next.wrapping_add(5));

    // peer acknowledges everything and closes too
    lab.send("p1", &segment(1001, next.wrapping_add(6), TcpFlags::FIN_ACK, b""));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(tcp_of(&out[0]).ack, 1002);
    assert!(lab.switch.tcp_read(1, &key, 1024).is_err());
}

#[test]
fn test_unacknowledged_data_retransmitted() {
    let lab = lab();
    let (key, next) = connect(&lab);
    lab.switch.tcp_write(1, &key, b"again").unwrap();
    lab.clear();

    lab.switch.tick(Instant::now() + Duration::from_secs(1));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(tcp_of(&out[0]).seq, next);
    assert_eq!(tcp_of(&out[0]).payload, b"again");
}

#[test]
fn test_segment_for_unknown_flow_reset() {
    let lab = lab();
    lab.send("p1", &segment(1001, 77, TcpFlags::ACK, b""));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let rst = tcp_of(&out[0]);
    assert!(rst.flags.rst);
    assert_eq!(rst.seq, 77);
}

#[test]
fn test_wildcard_listener() {
    let lab = lab();
    lab.switch.listen_tcp(1, sock("0.0.0.0:80")).unwrap();
    lab.send("p1", &segment(1000, 0, TcpFlags::SYN, b""));
    assert!(tcp_of(&lab.take("p1")[0]).flags.is_syn_ack());
}

#[test]
fn test_listen_requires_local_address() {
    let lab = lab();
    assert!(lab.switch.listen_tcp(1, sock("10.0.0.99:80")).is_err());
    assert!(lab.switch.listen_udp(1, sock("10.0.0.99:53")).is_err());
    assert!(lab.switch.listen_tcp(7, sock("10.0.0.1:80")).is_err());

    lab.switch.listen_tcp(1, sock("10.0.0.1:80")).unwrap();
    assert!(lab.switch.listen_tcp(1, sock("10.0.0.1:80")).is_err());
    lab.switch.unlisten_tcp(1, sock("10.0.0.1:80")).unwrap();

    // closed again
    lab.send("p1", &segment(1000, 0, TcpFlags::SYN, b""));
    assert!(tcp_of(&lab.take("p1")[0]).flags.rst);
}

#[test]
fn test_udp_endpoint() {
    let lab = lab();
    let local = sock("10.0.0.1:53");
    lab.switch.listen_udp(1, local).unwrap();

    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.0.1:53", b"query"));
    assert!(lab.take("p1").is_empty());
    let (from, data) = lab.switch.udp_recv(1, &local).unwrap().unwrap();
    assert_eq!(from, sock("10.0.0.10:5000"));
    assert_eq!(data, b"query");
    assert_eq!(lab.switch.udp_recv(1, &local).unwrap(), None);

    lab.switch.udp_send_to(1, local, from, b"answer".to_vec()).unwrap();
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    let reply = udp_of(&out[0]);
    assert_eq!(reply.src_port, 53);
    assert_eq!(reply.dst_port, 5000);
    assert_eq!(reply.payload, b"answer");

    lab.switch.unlisten_udp(1, local).unwrap();
    assert!(lab.switch.udp_recv(1, &local).is_err());
    assert!(lab.switch.udp_send_to(1, local, from, b"late".to_vec()).is_err());
}
