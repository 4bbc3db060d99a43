use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;
use crate::qdisc::WouldBlock;

mod util;
use util::*;

#[test]
fn restart_brings_link_up() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.caller.neighbour.link_up(pair.time);
    assert_eq!(pair.caller.neighbour.link_state(), LinkState::Restarting);
    pair.drive();
    assert_eq!(pair.caller.neighbour.link_state(), LinkState::Up);
    assert_eq!(pair.callee.neighbour.link_state(), LinkState::Up);
    assert_matches!(
        &pair.caller.take_sent()[..],
        [Frame::RestartRequest(cause)] if *cause == Cause::DTE_ORIGINATED
    );
    assert_matches!(&pair.callee.take_sent()[..], [Frame::RestartConfirmation]);
    assert_eq!(pair.caller.neighbour.poll_timeout(), None);
}

#[test]
fn unanswered_restart_is_retried() {
    let _guard = subscribe();
    let mut config = NeighbourConfig::default();
    config.restart_timeout(Duration::from_secs(10));
    let mut pair = Pair::new(config, NeighbourConfig::default());
    pair.caller.blocked = true;
    pair.caller.neighbour.link_up(pair.time);
    pair.drive_caller();
    pair.time += Duration::from_secs(10);
    pair.drive_caller();
    let sent = pair.caller.take_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|frame| matches!(frame, Frame::RestartRequest(_))));

    pair.caller.blocked = false;
    pair.time += Duration::from_secs(10);
    pair.drive();
    assert_eq!(pair.caller.neighbour.link_state(), LinkState::Up);
}

#[test]
fn connect_requires_link() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let result = pair.caller.neighbour.connect(
        pair.time,
        CALLEE_ADDRESS.parse().unwrap(),
        Facilities::default(),
        Bytes::new(),
    );
    assert_eq!(result, Err(ConnectError::LinkDown));

    pair.link_up();
    let result = pair.caller.neighbour.connect(
        pair.time,
        CALLEE_ADDRESS.parse().unwrap(),
        Facilities::default(),
        Bytes::from(vec![0; MAX_CALL_REQUEST_USER_DATA + 1]),
    );
    assert_eq!(result, Err(ConnectError::UserDataTooLong));
}

#[test]
fn call_held_until_restart_completes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.caller.neighbour.link_up(pair.time);
    let ch = pair
        .caller
        .neighbour
        .connect(
            pair.time,
            CALLEE_ADDRESS.parse().unwrap(),
            Facilities::default(),
            Bytes::from_static(b"hi"),
        )
        .unwrap();
    pair.drive_caller();
    assert_matches!(&pair.caller.take_sent()[..], [Frame::RestartRequest(_)]);

    pair.drive();
    assert_matches!(
        pair.caller.events.pop_front(),
        Some((x, Event::Connected { .. })) if x == ch
    );
    let (_, setup) = pair.callee.assert_incoming();
    assert_eq!(&setup.user_data[..], b"hi");
    assert!(setup.facilities.random.is_some());
}

#[test]
fn lowest_free_channel_is_used() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (a, _) = pair.connect();
    let (b, _) = pair.connect();
    assert_eq!(pair.caller.neighbour.lci(a), Lci::new(1));
    assert_eq!(pair.caller.neighbour.lci(b), Lci::new(2));

    pair.caller.neighbour.request_clear(pair.time, a).unwrap();
    pair.drive();
    assert_eq!(pair.caller.neighbour.lci(a), None);
    let (c, _) = pair.connect();
    assert_eq!(pair.caller.neighbour.lci(c), Lci::new(1));
    assert_ne!(a, c);
    // the stale handle does not reach the circuit now on channel 1
    assert_eq!(
        pair.caller
            .neighbour
            .send(pair.time, a, Bytes::from_static(b"x")),
        Err(SendError::UnknownCircuit)
    );
    assert_eq!(
        pair.caller.neighbour.request_clear(pair.time, a),
        Err(UnknownCircuit)
    );
}

#[test]
fn scenario_call_data_and_ack_policy() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();

    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"one"))
        .unwrap();
    pair.exchange();
    assert_eq!(
        pair.callee.events_for(callee_ch),
        [Event::Payload {
            data: Bytes::from_static(b"one"),
            qualifier: false
        }]
    );
    // window of two not yet full: the acknowledgement is held back
    assert!(pair.callee.take_sent().is_empty());
    let window = pair.callee.neighbour.window(callee_ch).unwrap();
    assert_eq!(window.vr(), 1);
    assert!(window.condition().contains(Condition::ACK_PENDING));

    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"two"))
        .unwrap();
    pair.exchange();
    assert_eq!(pair.callee.events_for(callee_ch).len(), 1);
    // full window: acknowledged at once
    assert_matches!(
        &pair.callee.take_sent()[..],
        [Frame::ReceiveReady { nr: 2 }]
    );
    let window = pair.caller.neighbour.window(caller_ch).unwrap();
    assert_eq!((window.va(), window.vs()), (2, 2));
    assert_eq!(pair.caller.neighbour.has_outstanding(caller_ch), Some(false));
}

#[test]
fn delayed_ack_fires() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, _) = pair.connect();
    let start = pair.time;
    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"one"))
        .unwrap();
    pair.drive();
    assert_eq!(pair.time, start + Duration::from_secs(3));
    assert_matches!(
        &pair.callee.take_sent()[..],
        [Frame::ReceiveReady { nr: 1 }]
    );
    assert_eq!(pair.caller.neighbour.has_outstanding(caller_ch), Some(false));
}

#[test]
fn scenario_invalid_ack_resets() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();

    // hold the callee's data in its window
    pair.callee.blocked = true;
    pair.callee
        .neighbour
        .send(pair.time, callee_ch, Bytes::from_static(b"lost"))
        .unwrap();
    pair.drive_callee();
    assert_eq!(pair.callee.neighbour.has_outstanding(callee_ch), Some(true));
    pair.callee.take_sent();
    pair.callee.blocked = false;

    // nr = 5 lies outside [va, vs] = [0, 1]
    let lci = pair.callee.neighbour.lci(callee_ch).unwrap();
    let bogus = Packet::new(lci, Modulus::Basic, Frame::ReceiveReady { nr: 5 });
    assert_eq!(
        pair.callee.neighbour.handle(pair.time, bogus.to_bytes()),
        Some(callee_ch)
    );
    assert_eq!(
        pair.callee.neighbour.state(callee_ch),
        Some(State::AwaitingResetConfirm)
    );
    assert_eq!(pair.callee.neighbour.has_outstanding(callee_ch), Some(false));

    pair.exchange();
    assert_matches!(
        &pair.callee.take_sent()[..],
        [Frame::ResetRequest(cause)] if cause.cause == Cause::LOCAL_PROCEDURE_ERROR.cause
    );
    assert_matches!(&pair.caller.take_sent()[..], [Frame::ResetConfirmation]);
    assert_eq!(pair.callee.neighbour.state(callee_ch), Some(State::Connected));
    assert_eq!(pair.caller.neighbour.state(caller_ch), Some(State::Connected));
    assert_matches!(&pair.callee.events_for(callee_ch)[..], [Event::Reset(_)]);
    assert_matches!(&pair.caller.events_for(caller_ch)[..], [Event::Reset(_)]);

    for (neighbour, ch) in [
        (&pair.caller.neighbour, caller_ch),
        (&pair.callee.neighbour, callee_ch),
    ] {
        let window = neighbour.window(ch).unwrap();
        assert_eq!(
            (window.vs(), window.va(), window.vr(), window.vl()),
            (0, 0, 0, 0)
        );
        assert!(window.condition().is_empty());
    }

    // data flows again after the reset
    pair.callee
        .neighbour
        .send(pair.time, callee_ch, Bytes::from_static(b"again"))
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.caller.events_for(caller_ch),
        [Event::Payload {
            data: Bytes::from_static(b"again"),
            qualifier: false
        }]
    );
}

#[test]
fn reset_clears_busy_conditions() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    pair.callee
        .neighbour
        .set_receiver_busy(callee_ch, true)
        .unwrap();
    pair.exchange();
    assert!(pair
        .caller
        .neighbour
        .window(caller_ch)
        .unwrap()
        .condition()
        .contains(Condition::PEER_RX_BUSY));

    pair.caller
        .neighbour
        .request_reset(pair.time, caller_ch)
        .unwrap();
    pair.exchange();
    for (neighbour, ch) in [
        (&pair.caller.neighbour, caller_ch),
        (&pair.callee.neighbour, callee_ch),
    ] {
        assert_eq!(neighbour.state(ch), Some(State::Connected));
        assert!(neighbour.window(ch).unwrap().condition().is_empty());
    }
}

#[test]
fn scenario_link_down_closes_everything() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let handles = (0..3).map(|_| pair.connect().0).collect::<Vec<_>>();
    for &ch in &handles {
        pair.caller
            .neighbour
            .send(pair.time, ch, Bytes::from_static(b"pending"))
            .unwrap();
    }
    pair.exchange();
    // acknowledgement and reset timers are armed on both ends
    assert!(pair.callee.neighbour.poll_timeout().is_some());
    pair.callee
        .neighbour
        .request_reset(pair.time, pair.callee.events.front().unwrap().0)
        .unwrap();
    assert_matches!(pair.callee.neighbour.poll(), Some((_, Event::Reset(_))));

    pair.callee.neighbour.link_down();
    let mut closed = Vec::new();
    while let Some((ch, event)) = pair.callee.neighbour.poll() {
        assert_eq!(event, Event::Closed(CloseReason::LinkDown));
        closed.push(ch);
    }
    assert_eq!(closed.len(), 3);
    assert_eq!(pair.callee.neighbour.circuit_count(), 0);
    assert_eq!(pair.callee.neighbour.poll_timeout(), None);
    assert!(pair.callee.neighbour.poll_transmit().is_none());

    // nothing fires later
    pair.callee.neighbour.handle_timeout(pair.time + Duration::from_secs(3600));
    assert!(pair.callee.neighbour.poll().is_none());
    assert!(pair.callee.neighbour.poll_transmit().is_none());
    for ch in closed {
        assert_eq!(pair.callee.neighbour.state(ch), None);
        assert_eq!(
            pair.callee.neighbour.send_interrupt(ch, Bytes::from_static(b"!")),
            Err(SendError::UnknownCircuit)
        );
    }
    assert_eq!(pair.callee.neighbour.link_state(), LinkState::Down);
}

#[test]
fn peer_restart_closes_circuits() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    let restart = Packet::new(
        Lci::LINK,
        Modulus::Basic,
        Frame::RestartRequest(Cause::NETWORK_CONGESTION),
    );
    assert_eq!(
        pair.callee.neighbour.handle(pair.time, restart.to_bytes()),
        None
    );
    assert_matches!(
        pair.callee.neighbour.poll(),
        Some((ch, Event::Closed(CloseReason::Restarted(cause))))
            if ch == callee_ch && cause == Cause::NETWORK_CONGESTION
    );
    assert_matches!(
        pair.callee.neighbour.poll_transmit(),
        Some(t) if Packet::decode(t.contents.clone()).frame == Frame::RestartConfirmation
    );
    assert_eq!(pair.callee.neighbour.link_state(), LinkState::Up);
    // the first restart was the one that brought the link up
    assert_eq!(pair.callee.neighbour.stats().restarts, 2);
    assert_eq!(pair.caller.neighbour.state(caller_ch), Some(State::Connected));
}

#[test]
fn refused_when_not_accepting() {
    let _guard = subscribe();
    let mut callee = NeighbourConfig::default();
    callee.accept_incoming(false);
    let mut pair = Pair::new(NeighbourConfig::default(), callee);
    pair.link_up();
    let ch = pair
        .caller
        .neighbour
        .connect(
            pair.time,
            CALLEE_ADDRESS.parse().unwrap(),
            Facilities::default(),
            Bytes::new(),
        )
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.caller.events_for(ch),
        [Event::Closed(CloseReason::Refused(Cause::NUMBER_BUSY))]
    );
    assert!(pair.callee.events.is_empty());
    assert_eq!(pair.callee.neighbour.stats().refused, 1);
    assert_eq!(pair.caller.neighbour.circuit_count(), 0);
}

#[test]
fn refused_at_circuit_limit() {
    let _guard = subscribe();
    let mut callee = NeighbourConfig::default();
    callee.max_circuits(1);
    let mut pair = Pair::new(NeighbourConfig::default(), callee);
    pair.link_up();
    pair.connect();
    let ch = pair
        .caller
        .neighbour
        .connect(
            pair.time,
            CALLEE_ADDRESS.parse().unwrap(),
            Facilities::default(),
            Bytes::new(),
        )
        .unwrap();
    pair.drive();
    assert_matches!(
        &pair.caller.events_for(ch)[..],
        [Event::Closed(CloseReason::Refused(_))]
    );
    assert_eq!(pair.callee.neighbour.circuit_count(), 1);
}

#[test]
fn call_collision_is_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (_, callee_ch) = pair.connect();
    let lci = pair.callee.neighbour.lci(callee_ch).unwrap();
    let call = Packet::new(lci, Modulus::Basic, Frame::CallRequest(CallSetup::default()));
    assert_eq!(pair.callee.neighbour.handle(pair.time, call.to_bytes()), None);
    assert!(pair.callee.neighbour.poll().is_none());
    assert!(pair.callee.neighbour.poll_transmit().is_none());
    assert_eq!(pair.callee.neighbour.state(callee_ch), Some(State::Connected));
}

#[test]
fn stray_frames_are_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let n = &mut pair.callee.neighbour;
    let unknown = Packet::new(Lci::new(77).unwrap(), Modulus::Basic, Frame::ReceiveReady { nr: 0 });
    assert_eq!(n.handle(pair.time, unknown.to_bytes()), None);
    let foreign = Packet::new(
        Lci::new(1).unwrap(),
        Modulus::Extended,
        Frame::ReceiveReady { nr: 0 },
    );
    assert_eq!(n.handle(pair.time, foreign.to_bytes()), None);
    assert_eq!(n.handle(pair.time, Bytes::from_static(&[0x10])), None);
    let diagnostic = Packet::new(
        Lci::LINK,
        Modulus::Basic,
        Frame::Diagnostic {
            code: 0x26,
            explanation: Bytes::new(),
        },
    );
    assert_eq!(n.handle(pair.time, diagnostic.to_bytes()), None);
    assert!(n.poll().is_none());
    assert!(n.poll_transmit().is_none());
    assert_eq!(n.stats().dropped, 3);
    assert_eq!(n.link_state(), LinkState::Up);
}

#[test]
fn clear_from_either_end() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    pair.caller
        .neighbour
        .request_clear(pair.time, caller_ch)
        .unwrap();
    assert_eq!(
        pair.caller.neighbour.state(caller_ch),
        Some(State::AwaitingClearConfirm)
    );
    pair.drive();
    assert_eq!(
        pair.caller.events_for(caller_ch),
        [Event::Closed(CloseReason::LocallyCleared)]
    );
    assert_eq!(
        pair.callee.events_for(callee_ch),
        [Event::Closed(CloseReason::Cleared(Cause::DTE_ORIGINATED))]
    );
    assert_eq!(pair.caller.neighbour.circuit_count(), 0);
    assert_eq!(pair.callee.neighbour.circuit_count(), 0);

    let (caller_ch, callee_ch) = pair.connect();
    pair.callee
        .neighbour
        .request_clear(pair.time, callee_ch)
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.caller.events_for(caller_ch),
        [Event::Closed(CloseReason::Cleared(Cause::DTE_ORIGINATED))]
    );
}

#[test]
fn clear_times_out_without_peer() {
    let _guard = subscribe();
    let mut config = CircuitConfig::default();
    config
        .clear_timeout(Duration::from_secs(1))
        .max_retries(2);
    let mut pair = Pair::with_circuit_config(config);
    pair.link_up();
    let (caller_ch, _) = pair.connect();
    pair.caller.blocked = true;
    pair.caller
        .neighbour
        .request_clear(pair.time, caller_ch)
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.caller.events_for(caller_ch),
        [Event::Closed(CloseReason::TimedOut)]
    );
    let clears = pair
        .caller
        .take_sent()
        .into_iter()
        .filter(|frame| matches!(frame, Frame::ClearRequest(_)))
        .count();
    assert_eq!(clears, 3);
}

#[test]
fn fragmented_messages_are_reassembled() {
    let _guard = subscribe();
    let mut config = CircuitConfig::default();
    config.packet_size_out(16).unwrap().window_out(7).unwrap();
    let mut pair = Pair::with_circuit_config(config);
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    let message = (0..100u8).collect::<Vec<_>>();
    pair.caller
        .neighbour
        .send_qualified(pair.time, caller_ch, Bytes::from(message.clone()))
        .unwrap();
    pair.drive();
    assert_eq!(
        pair.callee.events_for(callee_ch),
        [Event::Payload {
            data: Bytes::from(message),
            qualifier: true
        }]
    );
    let data_frames = pair
        .caller
        .take_sent()
        .into_iter()
        .filter(|frame| matches!(frame, Frame::Data(_)))
        .count();
    assert_eq!(data_frames, 7);
    assert_eq!(pair.caller.neighbour.has_outstanding(caller_ch), Some(false));
}

#[test]
fn facilities_negotiate_down() {
    let _guard = subscribe();
    let mut caller = CircuitConfig::default();
    caller
        .window_in(5)
        .unwrap()
        .window_out(6)
        .unwrap()
        .packet_size_in(512)
        .unwrap();
    let mut callee = CircuitConfig::default();
    callee
        .window_in(4)
        .unwrap()
        .window_out(7)
        .unwrap()
        .packet_size_out(256)
        .unwrap();
    let mut a = NeighbourConfig::default();
    a.circuit_config(Arc::new(caller));
    let mut b = NeighbourConfig::default();
    b.circuit_config(Arc::new(callee));
    let mut pair = Pair::new(a, b);
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();

    let caller_window = pair.caller.neighbour.window(caller_ch).unwrap();
    assert_eq!(caller_window.window_in(), 5);
    assert_eq!(caller_window.window_out(), 4);
    let callee_window = pair.callee.neighbour.window(callee_ch).unwrap();
    assert_eq!(callee_window.window_in(), 4);
    assert_eq!(callee_window.window_out(), 5);
    let agreed = pair.caller.neighbour.facilities(caller_ch).unwrap();
    assert_eq!(
        agreed.packet_size,
        Some(Directional {
            from_called: 256,
            from_calling: 128
        })
    );
    assert_eq!(
        pair.callee.neighbour.facilities(callee_ch).unwrap().packet_size,
        agreed.packet_size
    );
}

#[test]
fn extended_sequencing() {
    let _guard = subscribe();
    let mut neighbour = NeighbourConfig::default();
    neighbour.extended(true);
    let mut circuit = CircuitConfig::default();
    circuit.window_in(20).unwrap().window_out(20).unwrap();
    neighbour.circuit_config(Arc::new(circuit));
    let mut pair = Pair::new(neighbour.clone(), neighbour);
    pair.link_up();
    assert_eq!(pair.caller.neighbour.modulus(), Modulus::Extended);
    let (caller_ch, callee_ch) = pair.connect();
    for i in 0..30u8 {
        pair.caller
            .neighbour
            .send(pair.time, caller_ch, Bytes::from(vec![i]))
            .unwrap();
    }
    pair.drive();
    let got = pair
        .callee
        .events_for(callee_ch)
        .into_iter()
        .map(|event| match event {
            Event::Payload { data, .. } => data[0],
            other => panic!("unexpected {other:?}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(got, (0..30).collect::<Vec<_>>());
    assert_eq!(pair.callee.neighbour.window(callee_ch).unwrap().window_in(), 20);
}

#[test]
fn interrupt_round_trip() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    pair.caller
        .neighbour
        .send_interrupt(caller_ch, Bytes::from_static(b"!"))
        .unwrap();
    assert_eq!(
        pair.caller
            .neighbour
            .send_interrupt(caller_ch, Bytes::from_static(b"?")),
        Err(SendError::InterruptPending)
    );
    pair.exchange();
    assert_eq!(
        pair.callee.events_for(callee_ch),
        [Event::Interrupt(Bytes::from_static(b"!"))]
    );
    // confirmation arrived
    pair.caller
        .neighbour
        .send_interrupt(caller_ch, Bytes::from_static(b"?"))
        .unwrap();
}

#[derive(Default)]
struct TestDevice {
    sent: Vec<Bytes>,
    busy: bool,
}

impl NetDevice for TestDevice {
    fn transmit(&mut self, frame: &Bytes) -> Result<(), WouldBlock> {
        if self.busy {
            return Err(WouldBlock);
        }
        self.sent.push(frame.clone());
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.busy
    }
}

#[test]
fn flush_feeds_egress() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, _) = pair.connect();
    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"data"))
        .unwrap();
    pair.caller
        .neighbour
        .send_interrupt(caller_ch, Bytes::from_static(b"!"))
        .unwrap();

    let mut egress = Egress::new(QueueConfig::default());
    let mut dev = TestDevice {
        busy: true,
        ..TestDevice::default()
    };
    assert_eq!(pair.caller.neighbour.flush(pair.time, &mut egress, &mut dev), 2);
    assert_eq!(egress.len(), 2);
    dev.busy = false;
    assert_eq!(egress.restart(pair.time, &mut dev), 2);
    // the interrupt overtakes the data
    let frames = dev
        .sent
        .into_iter()
        .map(|x| Packet::decode(x).frame)
        .collect::<Vec<_>>();
    assert_matches!(&frames[..], [Frame::Interrupt(_), Frame::Data(_)]);
}

/// Flush a busy caller into a fresh egress queue, then drain it once the device frees up
fn flush_through_busy_device(pair: &mut Pair) -> Vec<Bytes> {
    let mut egress = Egress::new(QueueConfig::default());
    let mut dev = TestDevice {
        busy: true,
        ..TestDevice::default()
    };
    pair.caller.neighbour.flush(pair.time, &mut egress, &mut dev);
    dev.busy = false;
    egress.restart(pair.time, &mut dev);
    dev.sent
}

#[test]
fn reset_does_not_overtake_queued_data() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"stale"))
        .unwrap();
    pair.caller
        .neighbour
        .request_reset(pair.time, caller_ch)
        .unwrap();

    let wire = flush_through_busy_device(&mut pair);
    let frames = wire
        .iter()
        .map(|x| Packet::decode(x.clone()).frame)
        .collect::<Vec<_>>();
    assert_matches!(
        &frames[..],
        [Frame::Data(data), Frame::ResetRequest(_)] if data.ns == 0
    );

    for data in wire {
        pair.callee.neighbour.handle(pair.time, data);
    }
    pair.callee.drive(pair.time);
    assert_matches!(
        &pair.callee.events_for(callee_ch)[..],
        [Event::Payload { data, .. }, Event::Reset(_)] if data[..] == b"stale"[..]
    );
}

#[test]
fn clear_does_not_overtake_queued_data() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.link_up();
    let (caller_ch, callee_ch) = pair.connect();
    pair.caller
        .neighbour
        .send(pair.time, caller_ch, Bytes::from_static(b"last words"))
        .unwrap();
    pair.caller
        .neighbour
        .request_clear(pair.time, caller_ch)
        .unwrap();

    let wire = flush_through_busy_device(&mut pair);
    for data in wire {
        pair.callee.neighbour.handle(pair.time, data);
    }
    pair.callee.drive(pair.time);
    assert_matches!(
        &pair.callee.events_for(callee_ch)[..],
        [Event::Payload { data, .. }, Event::Closed(_)] if data[..] == b"last words"[..]
    );
}
