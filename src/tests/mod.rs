use std::time::Duration;

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::config::{EndpointConfig, SessionParams};
use crate::control::{ControlCodec, ControlMessage};
use crate::frame::{AckFrame, DataFrame};
use crate::session::timer::Timer;
use crate::shared::{ErrorCode, Event, SessionId, TransferError, TransmitKind};
use crate::{AbortError, CborCodec, DestroyError, SendError};

mod util;

use util::{data_frame, drop_first, subscribe, test_object, test_params, Pair};

#[test]
fn clean_transfer() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(350);

    let handle = pair
        .client
        .endpoint
        .send(pair.time, object.clone(), test_params())
        .unwrap();
    pair.drive();

    assert_matches!(
        &pair.client.events[..],
        [Event::SendComplete { session }] if *session == handle
    );
    assert_matches!(
        pair.server.events.first(),
        Some(Event::ReceiveStarted { total_size: 350, .. })
    );
    assert_matches!(pair.server.events.last(), Some(Event::ReceiveComplete { .. }));

    let blocks = pair.server.blocks();
    let offsets: Vec<u64> = blocks.iter().map(|(o, _)| *o).collect();
    let lengths: Vec<usize> = blocks.iter().map(|(_, d)| d.len()).collect();
    assert_eq!(offsets, [0, 100, 200, 300]);
    assert_eq!(lengths, [100, 100, 100, 50]);
    assert_eq!(pair.server.assembled(), object);

    // One copy of each block was enough
    for block in 0..4 {
        assert_eq!(pair.client.data_frames_for_block(block), 1);
    }
}

#[test]
fn lost_block_recovered_by_selective_retransmit() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(350);

    // Lose the first copy of block 1
    pair.client.filter = Some(drop_first(1, |t| {
        data_frame(t).is_some_and(|f| f.block_number == 1)
    }));
    pair.client
        .endpoint
        .send(pair.time, object.clone(), test_params())
        .unwrap();
    pair.drive();

    assert_matches!(&pair.client.events[..], [Event::SendComplete { .. }]);
    assert_eq!(pair.server.assembled(), object);

    // The receiver asked for exactly the missing block: bitmap 0b0010
    let selective: Vec<AckFrame> = pair
        .server
        .outbound
        .iter()
        .filter(|t| t.kind == TransmitKind::Ack)
        .map(|t| AckFrame::decode(t.contents.clone(), 1).unwrap())
        .filter(|a| !a.bitmap.is_empty())
        .collect();
    assert_eq!(selective.len(), 1);
    assert_eq!(selective[0].first_block_number, 0);
    assert_eq!(&selective[0].bitmap[..], [0b0010]);

    // Exactly one retransmission, of block 1 alone
    assert_eq!(pair.client.data_frames_for_block(0), 1);
    assert_eq!(pair.client.data_frames_for_block(1), 2);
    assert_eq!(pair.client.data_frames_for_block(2), 1);
    assert_eq!(pair.client.data_frames_for_block(3), 1);
}

#[test]
fn full_window_retransmit_on_timeout() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(350);

    // The entire first flight (START and all four blocks) is lost, so the
    // peer does not even know a transfer began; only the sender's retransmit
    // timer can recover.
    pair.client.filter = Some(drop_first(5, |_| true));
    let handle = pair
        .client
        .endpoint
        .send(pair.time, object.clone(), test_params())
        .unwrap();

    // Nothing can reach the peer before the retransmit timer at 2 * timeout
    let start = pair.time;
    while pair.step() {
        if !pair.server.events.is_empty() {
            break;
        }
    }
    assert!(pair.time - start >= 2 * test_params().timeout);

    pair.drive();
    assert_matches!(&pair.client.events[..], [Event::SendComplete { .. }]);
    assert_eq!(pair.server.assembled(), object);
    // Each block crossed the sender's queue twice, and exactly one retry was
    // consumed by the timeout
    for block in 0..4 {
        assert_eq!(pair.client.data_frames_for_block(block), 2);
    }
    assert_eq!(
        pair.client.endpoint.send_session(handle).retries_left(),
        test_params().max_retransmits - 1
    );
}

#[test]
fn duplicate_block_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(350);

    // The link duplicates block 2
    let mut duplicated = false;
    pair.client.filter = Some(Box::new(move |t| {
        if !duplicated && data_frame(t).is_some_and(|f| f.block_number == 2) {
            duplicated = true;
            vec![t.contents.clone(), t.contents.clone()]
        } else {
            vec![t.contents.clone()]
        }
    }));
    pair.client
        .endpoint
        .send(pair.time, object.clone(), test_params())
        .unwrap();
    pair.drive();

    assert_eq!(pair.server.assembled(), object);
    // Exactly one delivery of offset 200 despite two arrivals
    let offsets: Vec<u64> = pair.server.blocks().iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, [0, 100, 200, 300]);
}

#[test]
fn session_expiry_fails_the_transfer() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let params = SessionParams {
        timeout: Duration::from_millis(300),
        max_retransmits: 100,
        session_expiry: Duration::from_millis(1000),
        ..test_params()
    };

    // No acknowledgement ever gets through, and the object spans many
    // windows, so neither side can finish; the retry budget is deep enough
    // that only the expiry deadline can end the session.
    pair.server.filter = Some(Box::new(|_| vec![]));
    let handle = pair
        .client
        .endpoint
        .send(pair.time, test_object(5000), params)
        .unwrap();
    pair.drive();

    assert_matches!(
        &pair.client.events[..],
        [Event::SendFailed { session, error: TransferError::Expired }] if *session == handle
    );
    // The abort went out best-effort
    assert!(pair
        .client
        .outbound
        .iter()
        .any(|t| t.kind == TransmitKind::Control
            && matches!(
                CborCodec.decode(&t.contents),
                Ok(ControlMessage::Abort { .. })
            )));
    // The receiver died too, by inbound abort or its own expiry
    assert_matches!(pair.server.events.last(), Some(Event::ReceiveFailed { .. }));
}

#[test]
fn concurrent_bidirectional_transfers() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let a_to_b = test_object(300);
    let b_to_a = Bytes::from_static(&[0xab; 200]);

    let client_handle = pair
        .client
        .endpoint
        .send(pair.time, a_to_b.clone(), test_params())
        .unwrap();
    let server_handle = pair
        .server
        .endpoint
        .send(pair.time, b_to_a.clone(), test_params())
        .unwrap();
    pair.drive();

    // Identifier parity keeps the two directions disjoint
    let client_id = pair.client.endpoint.send_session(client_handle).id();
    let server_id = pair.server.endpoint.send_session(server_handle).id();
    assert_eq!(client_id.0 % 2, 1);
    assert_eq!(server_id.0 % 2, 0);

    assert!(pair
        .client
        .events
        .iter()
        .any(|e| matches!(e, Event::SendComplete { .. })));
    assert!(pair
        .server
        .events
        .iter()
        .any(|e| matches!(e, Event::SendComplete { .. })));
    assert_eq!(pair.server.assembled(), a_to_b);
    assert_eq!(pair.client.assembled(), b_to_a);
}

#[test]
fn resume_after_timeout() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(350);
    let params = SessionParams {
        max_retransmits: 1,
        ..test_params()
    };

    // Dead air: after the START gets through, nothing does, in either
    // direction, until the sender exhausts its budget.
    let mut passed_start = false;
    pair.client.filter = Some(Box::new(move |t| {
        if !passed_start && t.kind == TransmitKind::Control {
            passed_start = true;
            return vec![t.contents.clone()];
        }
        vec![]
    }));
    pair.server.filter = Some(Box::new(|_| vec![]));

    let handle = pair
        .client
        .endpoint
        .send(pair.time, object.clone(), params)
        .unwrap();
    while pair.step() {
        if !pair.client.events.is_empty() {
            break;
        }
    }
    assert_matches!(
        &pair.client.events[..],
        [Event::SendTimedOut { session }] if *session == handle
    );
    // The budget bounds emission: the original window plus max_retransmits
    // copies, then nothing more until resumed
    for block in 0..4 {
        assert_eq!(pair.client.data_frames_for_block(block), 2);
    }

    // Link restored; the application resumes the session
    pair.client.filter = None;
    pair.server.filter = None;
    pair.client.endpoint.resume(pair.time, handle).unwrap();
    pair.drive();

    assert_matches!(pair.client.events.last(), Some(Event::SendComplete { .. }));
    assert_eq!(pair.server.assembled(), object);

    // The first block re-emitted after the resume carries the RESUME flag,
    // and only that one
    let resumed: Vec<DataFrame> = pair
        .client
        .outbound
        .iter()
        .filter_map(data_frame)
        .filter(|f| f.resume)
        .collect();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].block_number, 0);

    // A completed session cannot be resumed again
    assert_eq!(
        pair.client.endpoint.resume(pair.time, handle),
        Err(crate::ResumeError::NotResumable)
    );
}

#[test]
fn resume_offset_mismatch_aborts_the_receiver() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    // Two windows; the second never arrives, so the receiver sits at
    // window base 400
    let object = test_object(800);

    pair.client.filter = Some(Box::new(|t| match data_frame(t) {
        Some(f) if f.block_number >= 4 => vec![],
        _ => vec![t.contents.clone()],
    }));
    pair.client
        .endpoint
        .send(pair.time, object, test_params())
        .unwrap();
    for _ in 0..100 {
        if !pair.step() || pair.server.blocks().len() == 4 {
            break;
        }
    }
    let server_handle = match pair.server.events.first() {
        Some(Event::ReceiveStarted { session, .. }) => *session,
        other => panic!("expected ReceiveStarted, got {other:?}"),
    };
    assert_eq!(
        pair.server.endpoint.recv_session(server_handle).window_base(),
        400
    );

    // A resume from a window base the receiver already moved past means the
    // sender's notion of progress diverged; the receiver gives up
    let id = pair.server.endpoint.recv_session(server_handle).id();
    let mut buf = BytesMut::new();
    CborCodec.encode(
        &ControlMessage::Resume {
            session_id: id,
            offset: 0,
        },
        &mut buf,
    );
    pair.server.endpoint.handle_datagram(pair.time, buf.freeze());
    while let Some(event) = pair.server.endpoint.poll() {
        pair.server.events.push(event);
    }
    assert_matches!(
        pair.server.events.last(),
        Some(Event::ReceiveFailed { error: TransferError::Aborted, .. })
    );
}

#[test]
fn lossy_link_still_delivers_in_order() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let params = SessionParams {
        block_size: 100,
        window_size: 8,
        timeout: Duration::from_millis(100),
        max_retransmits: 10,
        session_expiry: Duration::from_secs(120),
    };
    let object = test_object(10_000);

    // Seeded pseudo-random loss and duplication of data frames; every loss
    // must be healed by a selective retransmit, every duplicate discarded.
    let mut state = 0x12345678u32;
    pair.client.filter = Some(Box::new(move |t| {
        if t.kind != TransmitKind::Data {
            return vec![t.contents.clone()];
        }
        // xorshift32
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        match state % 10 {
            0 | 1 | 2 => vec![],
            3 => vec![t.contents.clone(), t.contents.clone()],
            _ => vec![t.contents.clone()],
        }
    }));

    pair.client
        .endpoint
        .send(pair.time, object.clone(), params)
        .unwrap();
    pair.drive();

    assert_matches!(pair.client.events.last(), Some(Event::SendComplete { .. }));
    // `assembled` asserts the offsets form an unbroken ascending prefix
    assert_eq!(pair.server.assembled(), object);
}

#[test]
fn large_window_uses_heap_bitmap() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let params = SessionParams {
        block_size: 10,
        window_size: 64,
        ..test_params()
    };
    let object = test_object(1000);

    pair.client
        .endpoint
        .send(pair.time, object.clone(), params)
        .unwrap();
    pair.drive();

    assert_matches!(pair.client.events.last(), Some(Event::SendComplete { .. }));
    assert_eq!(pair.server.assembled(), object);
}

#[test]
fn admission_respects_session_limit() {
    let _guard = subscribe();
    let config = EndpointConfig {
        max_recv_sessions: 1,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(config);
    let params = SessionParams {
        max_retransmits: 1,
        ..test_params()
    };

    pair.client
        .endpoint
        .send(pair.time, test_object(5000), params)
        .unwrap();
    pair.client
        .endpoint
        .send(pair.time, test_object(5000), params)
        .unwrap();
    pair.drive();

    // Only one START was honored; the other transfer starved and timed out
    let started = pair
        .server
        .events
        .iter()
        .filter(|e| matches!(e, Event::ReceiveStarted { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(pair.server.endpoint.session_count(), 1);
    assert!(pair
        .client
        .events
        .iter()
        .any(|e| matches!(e, Event::SendTimedOut { .. })));
    assert!(pair
        .client
        .events
        .iter()
        .any(|e| matches!(e, Event::SendComplete { .. })));
}

#[test]
fn send_capacity_enforced() {
    let _guard = subscribe();
    let config = EndpointConfig {
        max_send_sessions: 1,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(config);

    pair.client
        .endpoint
        .send(pair.time, test_object(100), test_params())
        .unwrap();
    let err = pair
        .client
        .endpoint
        .send(pair.time, test_object(100), test_params())
        .unwrap_err();
    assert_eq!(err, SendError::MaxSessionsReached);
}

#[test]
fn empty_object_refused() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let err = pair
        .client
        .endpoint
        .send(pair.time, Bytes::new(), test_params())
        .unwrap_err();
    assert_eq!(err, SendError::EmptyObject);
}

#[test]
fn invalid_start_refused_with_control_ack() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());

    let mut buf = BytesMut::new();
    CborCodec.encode(
        &ControlMessage::Start {
            session_id: SessionId(0x0101),
            object_size: 1000,
            block_size: 0, // nonsense
            window_size: 4,
            timeout_ms: 100,
            max_retransmits: 3,
            expiry_ms: 30_000,
        },
        &mut buf,
    );
    pair.server.endpoint.handle_datagram(pair.time, buf.freeze());

    let reply = pair.server.endpoint.poll_transmit().expect("a refusal");
    assert_eq!(reply.kind, TransmitKind::Control);
    assert_matches!(
        CborCodec.decode(&reply.contents),
        Ok(ControlMessage::Ack {
            session_id: SessionId(0x0101),
            error: ErrorCode::InvalidParam
        })
    );
    assert_eq!(pair.server.endpoint.session_count(), 0);
}

#[test]
fn oversized_window_refused_with_no_memory() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig {
        max_receive_buffer: 4096,
        ..EndpointConfig::default()
    });

    let mut buf = BytesMut::new();
    CborCodec.encode(
        &ControlMessage::Start {
            session_id: SessionId(0x0101),
            object_size: 1_000_000,
            block_size: 1024,
            window_size: 64, // 64 KiB of buffer against a 4 KiB cap
            timeout_ms: 100,
            max_retransmits: 3,
            expiry_ms: 30_000,
        },
        &mut buf,
    );
    pair.server.endpoint.handle_datagram(pair.time, buf.freeze());

    let reply = pair.server.endpoint.poll_transmit().expect("a refusal");
    assert_matches!(
        CborCodec.decode(&reply.contents),
        Ok(ControlMessage::Ack {
            error: ErrorCode::NoMemory,
            ..
        })
    );
}

#[test]
fn peer_refusal_fails_the_sender() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());

    let handle = pair
        .client
        .endpoint
        .send(pair.time, test_object(100), test_params())
        .unwrap();
    let id = pair.client.endpoint.send_session(handle).id();

    let mut buf = BytesMut::new();
    CborCodec.encode(
        &ControlMessage::Ack {
            session_id: id,
            error: ErrorCode::NoMemory,
        },
        &mut buf,
    );
    pair.client.endpoint.handle_datagram(pair.time, buf.freeze());

    let event = pair.client.endpoint.poll().expect("failure event");
    assert_matches!(
        event,
        Event::SendFailed {
            error: TransferError::Peer(ErrorCode::NoMemory),
            ..
        }
    );
}

#[test]
fn unroutable_datagrams_dropped_silently() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());

    // Too short for anything
    pair.server
        .endpoint
        .handle_datagram(pair.time, Bytes::from_static(&[0x01]));
    // A plausible data frame for a session nobody knows
    let mut buf = BytesMut::new();
    DataFrame {
        session_id: SessionId(0x0777),
        block_number: 0,
        resume: false,
        last: false,
        payload: Bytes::from_static(&[0u8; 100]),
    }
    .encode(&mut buf);
    pair.server.endpoint.handle_datagram(pair.time, buf.freeze());
    // Random noise
    pair.server
        .endpoint
        .handle_datagram(pair.time, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]));

    assert!(pair.server.endpoint.poll_transmit().is_none());
    assert!(pair.server.endpoint.poll().is_none());
    assert_eq!(pair.server.endpoint.session_count(), 0);
}

#[test]
fn stale_selective_ack_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    // Two windows of four blocks; the second window stalls in flight
    let object = test_object(800);

    pair.client.filter = Some(Box::new(|t| match data_frame(t) {
        Some(f) if f.block_number >= 4 => vec![],
        _ => vec![t.contents.clone()],
    }));
    let handle = pair
        .client
        .endpoint
        .send(pair.time, object, test_params())
        .unwrap();
    for _ in 0..100 {
        if !pair.step() || pair.client.endpoint.send_session(handle).window_base() == 400 {
            break;
        }
    }
    assert_eq!(pair.client.endpoint.send_session(handle).window_base(), 400);
    let armed = pair
        .client
        .endpoint
        .send_session(handle)
        .timers
        .get(Timer::Retransmit);
    assert!(armed.is_some());
    let sent_before = pair.client.outbound.len();

    // An ACK naming window 0, long since advanced past: a leftover the
    // sender must not honor. Nothing may be resent and the timer must not
    // be disturbed.
    let id = pair.client.endpoint.send_session(handle).id();
    let stale = AckFrame {
        session_id: id,
        error_code: 0,
        first_block_number: 0,
        bitmap: Bytes::from_static(&[0b0000_1111]),
    };
    let mut buf = BytesMut::new();
    stale.encode(&mut buf);
    pair.client.endpoint.handle_datagram(pair.time, buf.freeze());

    // The full-window form of the same leftover must not advance the
    // window again either
    let stale_full = AckFrame {
        session_id: id,
        error_code: 0,
        first_block_number: 0,
        bitmap: Bytes::new(),
    };
    let mut buf = BytesMut::new();
    stale_full.encode(&mut buf);
    pair.client.endpoint.handle_datagram(pair.time, buf.freeze());

    assert!(pair.client.endpoint.poll_transmit().is_none());
    assert_eq!(pair.client.endpoint.send_session(handle).window_base(), 400);
    assert_eq!(
        pair.client
            .endpoint
            .send_session(handle)
            .timers
            .get(Timer::Retransmit),
        armed
    );
}

#[test]
fn duplicated_full_window_ack_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    // Two full windows; skipping either would be unrecoverable
    let object = test_object(800);

    // The link duplicates every acknowledgement the receiver emits
    pair.server.filter = Some(Box::new(|t| {
        if t.kind == TransmitKind::Ack {
            vec![t.contents.clone(), t.contents.clone()]
        } else {
            vec![t.contents.clone()]
        }
    }));
    pair.client
        .endpoint
        .send(pair.time, object.clone(), test_params())
        .unwrap();
    pair.drive();

    // The duplicate of each full-window ACK names the window already
    // advanced past and is dropped, so no window is skipped
    assert_matches!(pair.client.events.last(), Some(Event::SendComplete { .. }));
    assert_eq!(pair.server.assembled(), object);
    for block in 0..8 {
        assert_eq!(pair.client.data_frames_for_block(block), 1);
    }
}

#[test]
fn local_abort_reaches_the_peer() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());
    let object = test_object(100_000);

    // Stall after the first window so the session stays live
    pair.client.filter = Some(Box::new(|t| match data_frame(t) {
        Some(f) if f.block_number >= 4 => vec![],
        _ => vec![t.contents.clone()],
    }));
    let handle = pair
        .client
        .endpoint
        .send(pair.time, object, test_params())
        .unwrap();
    for _ in 0..20 {
        if !pair.step() || !pair.server.blocks().is_empty() {
            break;
        }
    }

    // Destroying a live session is refused
    assert_eq!(
        pair.client.endpoint.destroy_session(handle),
        Err(DestroyError::SessionInProgress)
    );

    pair.client.endpoint.abort(handle).unwrap();
    pair.drive();

    assert_matches!(
        pair.server.events.last(),
        Some(Event::ReceiveFailed {
            error: TransferError::Peer(ErrorCode::SessionAborted),
            ..
        })
    );
    // Aborting again is API misuse
    assert_eq!(pair.client.endpoint.abort(handle), Err(AbortError::Terminal));
    // Now terminal, so the slot can be released
    pair.client.endpoint.destroy_session(handle).unwrap();
    assert_eq!(pair.client.endpoint.session_count(), 0);
}

#[test]
fn start_colliding_with_undestroyed_id_dropped() {
    let _guard = subscribe();
    let mut pair = Pair::new(EndpointConfig::default());

    pair.client
        .endpoint
        .send(pair.time, test_object(350), test_params())
        .unwrap();
    pair.drive();
    assert_eq!(pair.server.endpoint.session_count(), 1);
    let server_handle = match pair.server.events.first() {
        Some(Event::ReceiveStarted { session, .. }) => *session,
        other => panic!("expected ReceiveStarted, got {other:?}"),
    };
    let id = pair.server.endpoint.recv_session(server_handle).id();

    let start_for = |id| {
        let mut buf = BytesMut::new();
        CborCodec.encode(
            &ControlMessage::Start {
                session_id: id,
                object_size: 1000,
                block_size: 100,
                window_size: 4,
                timeout_ms: 100,
                max_retransmits: 3,
                expiry_ms: 30_000,
            },
            &mut buf,
        );
        buf.freeze()
    };

    // A fresh START under an id whose state still exists must not be honored
    pair.server.endpoint.handle_datagram(pair.time, start_for(id));
    assert_eq!(pair.server.endpoint.session_count(), 1);
    assert!(pair.server.endpoint.poll_transmit().is_none());

    // Once destroyed, the identifier is free again
    pair.server.endpoint.destroy_session(server_handle).unwrap();
    pair.server.endpoint.handle_datagram(pair.time, start_for(id));
    assert_eq!(pair.server.endpoint.session_count(), 1);
}
