use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use unison_network::{
    CtrlEvent, Selector, SelectorConfig, SelectorEvent, SelectorHandle, SelectorStatus, Token,
    encode_frame,
};

const STAGE: Duration = Duration::from_secs(2);
const WAIT: Duration = Duration::from_secs(5);

fn spawn_selecting(listen_port: u16, mcast_port: u16) -> SelectorHandle {
    let cfg = SelectorConfig {
        listen_ip: Ipv4Addr::LOCALHOST,
        listen_port,
        multicast_group: Ipv4Addr::new(239, 0, 0, 83),
        multicast_port: mcast_port,
        tick_interval: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(1),
    };
    let handle = Selector::spawn(cfg).unwrap();

    let status = handle.status();
    assert_eq!(
        status.await_reached(SelectorStatus::Init, Some(STAGE)).unwrap(),
        SelectorStatus::Init
    );
    status.set(SelectorStatus::RequestReady);
    assert_eq!(
        status.await_reached(SelectorStatus::Ready, Some(STAGE)).unwrap(),
        SelectorStatus::Ready
    );
    status.set(SelectorStatus::RequestSelect);
    assert_eq!(
        status.await_reached(SelectorStatus::Select, Some(STAGE)).unwrap(),
        SelectorStatus::Select
    );
    handle
}

fn shutdown(mut handle: SelectorHandle) {
    handle.status().set(SelectorStatus::RequestStop);
    handle.control().post(CtrlEvent::Interrupt);
    assert_eq!(
        handle.status().await_reached(SelectorStatus::Stopped, Some(WAIT)).unwrap(),
        SelectorStatus::Stopped
    );
    handle.join();
}

/// Pulls events until `pick` accepts one; ticks and the rest are skipped.
fn wait_for<T>(handle: &SelectorHandle, mut pick: impl FnMut(SelectorEvent) -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(evt) = handle.events().get_timeout(Duration::from_millis(100)) {
            if let Some(out) = pick(evt) {
                return out;
            }
        }
    }
    panic!("expected event did not arrive");
}

#[test]
fn framed_exchange_between_two_selectors() {
    let a = spawn_selecting(0, 47021);
    let b = spawn_selecting(0, 47021);
    let a_port = a.bound_port();
    assert!(a_port > 0);

    // b dials a; a learns of the newcomer
    b.control().post(CtrlEvent::ConnectRequest {
        addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, a_port)),
    });
    let inbound_tok = wait_for(&a, |evt| match evt {
        SelectorEvent::IncomingConnect(tok) => Some(tok),
        _ => None,
    });

    // one small and one staging-buffer-sized payload, coalesced by a
    let small = b"hello cluster".to_vec();
    let big = vec![0x42_u8; 20_000];
    a.control().post(CtrlEvent::SendPacket { conn: inbound_tok, frame: encode_frame(&small) });
    a.control().post(CtrlEvent::SendPacket { conn: inbound_tok, frame: encode_frame(&big) });

    let (outbound_tok, first) = wait_for(&b, |evt| match evt {
        SelectorEvent::PacketAvailable(pkt) => {
            assert!(pkt.src_ip.is_none());
            Some((pkt.conn, pkt.body.written().to_vec()))
        }
        _ => None,
    });
    assert_eq!(first, small);
    let second = wait_for(&b, |evt| match evt {
        SelectorEvent::PacketAvailable(pkt) => Some(pkt.body.written().to_vec()),
        _ => None,
    });
    assert_eq!(second, big);

    // and back up the same connection
    b.control().post(CtrlEvent::SendPacket { conn: outbound_tok, frame: encode_frame(b"ack") });
    let reply = wait_for(&a, |evt| match evt {
        SelectorEvent::PacketAvailable(pkt) => Some(pkt.body.written().to_vec()),
        _ => None,
    });
    assert_eq!(reply, b"ack");

    b.control().post(CtrlEvent::Disconnect { conn: outbound_tok });

    shutdown(a);
    shutdown(b);
}

#[test]
fn stale_send_target_is_dropped() {
    let a = spawn_selecting(0, 47022);
    // never handed out by the selector; must be logged and ignored
    a.control().post(CtrlEvent::SendPacket { conn: Token(999), frame: encode_frame(b"void") });
    a.control().post(CtrlEvent::Disconnect { conn: Token(999) });

    // the selector is still alive and ticking afterwards
    let got_tick = {
        let deadline = Instant::now() + WAIT;
        loop {
            match a.events().get_timeout(Duration::from_millis(100)) {
                Some(SelectorEvent::Interrupt) => break true,
                Some(_) => {}
                None if Instant::now() > deadline => break false,
                None => {}
            }
        }
    };
    assert!(got_tick);
    shutdown(a);
}

#[test]
fn bind_collision_adjusts_published_port() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let a = spawn_selecting(taken, 47023);
    assert_eq!(a.bound_port(), taken + 1);
    shutdown(a);
}

#[test]
fn periodic_ticks_arrive_without_traffic() {
    let a = spawn_selecting(0, 47024);
    let evt = a.events().get_timeout(Duration::from_secs(2)).expect("tick");
    assert!(matches!(evt, SelectorEvent::Interrupt));
    // and they keep coming
    let evt = a.events().get_timeout(Duration::from_secs(2)).expect("second tick");
    assert!(matches!(evt, SelectorEvent::Interrupt));
    shutdown(a);
}
