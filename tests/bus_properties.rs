//! Property-based tests for the bus.
//!
//! A reference model mirrors the observable contract of the non-blocking
//! surface: id assignment (first hole, else first fresh slot), FIFO message
//! order, capacity bounds, batch opportunism and broadcast atomicity. Random
//! operation sequences must behave identically on the bus and the model.

use std::collections::VecDeque;

use corobus::{Bus, BusError, ChannelId};
use proptest::prelude::*;

/// Ids this high are never assigned within a test run; they probe the
/// missing-channel paths.
const BOGUS_BASE: u32 = 1000;

#[derive(Debug, Clone)]
enum Op {
    Open { capacity: usize },
    Close { slot: usize },
    TrySend { slot: usize, msg: u32 },
    TryRecv { slot: usize },
    TrySendMany { slot: usize, msgs: Vec<u32> },
    TryRecvMany { slot: usize, len: usize },
    TryBroadcast { msg: u32 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0usize..4).prop_map(|capacity| Op::Open { capacity }),
        1 => (0usize..8).prop_map(|slot| Op::Close { slot }),
        4 => ((0usize..8), any::<u32>()).prop_map(|(slot, msg)| Op::TrySend { slot, msg }),
        4 => (0usize..8).prop_map(|slot| Op::TryRecv { slot }),
        2 => ((0usize..8), proptest::collection::vec(any::<u32>(), 0..6))
            .prop_map(|(slot, msgs)| Op::TrySendMany { slot, msgs }),
        2 => ((0usize..8), (0usize..6)).prop_map(|(slot, len)| Op::TryRecvMany { slot, len }),
        2 => any::<u32>().prop_map(|msg| Op::TryBroadcast { msg }),
    ]
}

#[derive(Debug)]
struct ModelChannel {
    capacity: usize,
    fifo: VecDeque<u32>,
}

/// Reference implementation of the non-blocking bus contract.
#[derive(Debug, Default)]
struct ModelBus {
    slots: Vec<Option<ModelChannel>>,
}

impl ModelBus {
    fn open(&mut self, capacity: usize) -> usize {
        let channel = ModelChannel {
            capacity: capacity.max(1),
            fifo: VecDeque::new(),
        };
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            self.slots[id] = Some(channel);
            id
        } else {
            self.slots.push(Some(channel));
            self.slots.len() - 1
        }
    }

    fn close(&mut self, id: usize) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = None;
        }
    }

    fn channel(&mut self, id: usize) -> Option<&mut ModelChannel> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn try_send(&mut self, id: usize, msg: u32) -> Result<(), BusError> {
        let Some(channel) = self.channel(id) else {
            return Err(BusError::NoChannel);
        };
        if channel.fifo.len() >= channel.capacity {
            return Err(BusError::WouldBlock);
        }
        channel.fifo.push_back(msg);
        Ok(())
    }

    fn try_recv(&mut self, id: usize) -> Result<u32, BusError> {
        let Some(channel) = self.channel(id) else {
            return Err(BusError::NoChannel);
        };
        channel.fifo.pop_front().ok_or(BusError::WouldBlock)
    }

    fn try_send_many(&mut self, id: usize, msgs: &[u32]) -> Result<usize, BusError> {
        let Some(channel) = self.channel(id) else {
            return Err(BusError::NoChannel);
        };
        let moved = msgs.len().min(channel.capacity - channel.fifo.len());
        if moved == 0 && !msgs.is_empty() {
            return Err(BusError::WouldBlock);
        }
        channel.fifo.extend(&msgs[..moved]);
        Ok(moved)
    }

    fn try_recv_many(&mut self, id: usize, len: usize) -> Result<Vec<u32>, BusError> {
        let Some(channel) = self.channel(id) else {
            return Err(BusError::NoChannel);
        };
        let moved = len.min(channel.fifo.len());
        if moved == 0 && len > 0 {
            return Err(BusError::WouldBlock);
        }
        Ok(channel.fifo.drain(..moved).collect())
    }

    fn try_broadcast(&mut self, msg: u32) -> Result<(), BusError> {
        let open: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect();
        if open.is_empty() {
            return Err(BusError::NoChannel);
        }
        let any_full = open.iter().any(|&id| {
            let channel = self.slots[id].as_ref().expect("open id vanished");
            channel.fifo.len() >= channel.capacity
        });
        if any_full {
            return Err(BusError::WouldBlock);
        }
        for id in open {
            self.slots[id]
                .as_mut()
                .expect("open id vanished")
                .fifo
                .push_back(msg);
        }
        Ok(())
    }
}

/// Picks a known id for `slot`, or a guaranteed-missing one past the end.
fn pick(ids: &[ChannelId], slot: usize) -> ChannelId {
    if slot < ids.len() {
        ids[slot]
    } else {
        ChannelId::from_index(BOGUS_BASE + slot as u32)
    }
}

proptest! {
    #[test]
    fn bus_matches_reference_model(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let bus = Bus::new();
        let mut model = ModelBus::default();
        let mut ids: Vec<ChannelId> = Vec::new();

        for op in ops {
            match op {
                Op::Open { capacity } => {
                    let id = bus.open(capacity);
                    let expected = model.open(capacity);
                    prop_assert_eq!(id.index() as usize, expected);
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Op::Close { slot } => {
                    let id = pick(&ids, slot);
                    bus.close(id);
                    model.close(id.index() as usize);
                }
                Op::TrySend { slot, msg } => {
                    let id = pick(&ids, slot);
                    prop_assert_eq!(bus.try_send(id, msg), model.try_send(id.index() as usize, msg));
                }
                Op::TryRecv { slot } => {
                    let id = pick(&ids, slot);
                    prop_assert_eq!(bus.try_recv(id), model.try_recv(id.index() as usize));
                }
                Op::TrySendMany { slot, msgs } => {
                    let id = pick(&ids, slot);
                    prop_assert_eq!(
                        bus.try_send_many(id, &msgs),
                        model.try_send_many(id.index() as usize, &msgs)
                    );
                }
                Op::TryRecvMany { slot, len } => {
                    let id = pick(&ids, slot);
                    let mut buf = vec![0u32; len];
                    match (bus.try_recv_many(id, &mut buf), model.try_recv_many(id.index() as usize, len)) {
                        (Ok(moved), Ok(expected)) => {
                            prop_assert_eq!(moved, expected.len());
                            prop_assert_eq!(&buf[..moved], expected.as_slice());
                        }
                        (Err(actual), Err(expected)) => prop_assert_eq!(actual, expected),
                        (actual, expected) => {
                            prop_assert!(false, "diverged: bus {:?}, model {:?}", actual, expected);
                        }
                    }
                }
                Op::TryBroadcast { msg } => {
                    prop_assert_eq!(bus.try_broadcast(msg), model.try_broadcast(msg));
                }
            }

            // The capacity bound holds after every operation.
            for &id in &ids {
                if bus.is_open(id) {
                    let len = bus.channel_len(id).expect("open id has a length");
                    let capacity = bus.channel_capacity(id).expect("open id has a capacity");
                    prop_assert!(capacity >= 1);
                    prop_assert!(len <= capacity);
                }
            }
        }

        // Drain every channel both sides and compare the leftovers.
        for &id in &ids {
            loop {
                let actual = bus.try_recv(id);
                let expected = model.try_recv(id.index() as usize);
                prop_assert_eq!(actual, expected);
                if actual.is_err() {
                    break;
                }
            }
        }
    }

    #[test]
    fn fifo_order_is_preserved(msgs in proptest::collection::vec(any::<u32>(), 0..64)) {
        let bus = Bus::new();
        let id = bus.open(msgs.len());
        for &msg in &msgs {
            bus.try_send(id, msg).expect("capacity covers every message");
        }

        let mut out = Vec::new();
        while let Ok(msg) = bus.try_recv(id) {
            out.push(msg);
        }
        prop_assert_eq!(out, msgs);
    }

    #[test]
    fn overload_never_exceeds_capacity(
        capacity in 0usize..8,
        msgs in proptest::collection::vec(any::<u32>(), 0..32),
    ) {
        let bus = Bus::new();
        let id = bus.open(capacity);
        let effective = bus.channel_capacity(id).expect("open channel");
        prop_assert!(effective >= 1);

        for msg in msgs {
            let _ = bus.try_send(id, msg);
            prop_assert!(bus.channel_len(id).expect("open channel") <= effective);
        }
    }

    #[test]
    fn broadcast_is_all_or_nothing(
        channels in proptest::collection::vec((1usize..4, 0usize..4), 1..6),
        msg in any::<u32>(),
    ) {
        let bus = Bus::new();
        let mut ids = Vec::new();
        for &(capacity, preload) in &channels {
            let id = bus.open(capacity);
            for n in 0..preload.min(capacity) {
                bus.try_send(id, n as u32).expect("preload fits");
            }
            ids.push(id);
        }

        let before: Vec<usize> = ids
            .iter()
            .map(|&id| bus.channel_len(id).expect("open channel"))
            .collect();
        let any_full = ids.iter().any(|&id| {
            bus.channel_len(id).expect("open channel")
                == bus.channel_capacity(id).expect("open channel")
        });

        match bus.try_broadcast(msg) {
            Ok(()) => {
                prop_assert!(!any_full);
                for (&id, &len) in ids.iter().zip(&before) {
                    prop_assert_eq!(bus.channel_len(id).expect("open channel"), len + 1);
                    // The broadcast message is the channel's tail.
                    let mut last = None;
                    while let Ok(received) = bus.try_recv(id) {
                        last = Some(received);
                    }
                    prop_assert_eq!(last, Some(msg));
                }
            }
            Err(BusError::WouldBlock) => {
                prop_assert!(any_full);
                for (&id, &len) in ids.iter().zip(&before) {
                    prop_assert_eq!(bus.channel_len(id).expect("open channel"), len);
                }
            }
            Err(other) => {
                prop_assert!(false, "unexpected error: {}", other);
            }
        }
    }
}
