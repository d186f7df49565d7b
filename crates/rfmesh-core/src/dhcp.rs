//! Master-side address assignment
//!
//! Triggered by an inbound address request relayed from a poll node. The
//! engine derives the requester's parent position in the octal tree, picks
//! the lowest free child slot, offers the resulting address, and holds the
//! offer pending until the requester confirms it. Only one offer is
//! outstanding at a time; a new request overwrites the pending slot, and a
//! binding is committed only on a confirmation that matches the most recent
//! offer within the route timeout.

use crate::address::{Addr, ChildBitmap, NodeId};
use crate::config::MAX_CHILDREN_CAP;
use crate::mesh::MeshStats;
use crate::message::{AddrRequest, FrameHeader, MessageType};
use crate::table::BindingTable;
use crate::traits::{Clock, Network};
use tracing::{debug, trace};

/// The single outstanding offer between response and confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOffer {
    pub id: NodeId,
    pub addr: Addr,
    armed_at: u32,
    timeout_ms: u32,
}

/// Address assignment engine; meaningful only on the master
#[derive(Debug)]
pub struct DhcpEngine {
    max_children: u8,
    pending: Option<PendingOffer>,
}

impl DhcpEngine {
    /// Create an engine allowing `max_children` child slots per node,
    /// clamped to the octal-digit cap.
    pub fn new(max_children: u8) -> Self {
        Self {
            max_children: max_children.clamp(1, MAX_CHILDREN_CAP),
            pending: None,
        }
    }

    /// The offer currently awaiting confirmation, if any
    pub fn pending(&self) -> Option<&PendingOffer> {
        self.pending.as_ref()
    }

    /// Process a latched address request frame.
    ///
    /// Generates and offers a child address. Requests that cannot be served
    /// (bad id, malformed payload, no free slot) are dropped silently; the
    /// requester recovers through its own retry/backoff.
    pub fn process_request<C: Clock, N: Network>(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        table: &BindingTable,
        clock: &C,
        network: &mut N,
        stats: &mut MeshStats,
    ) {
        let requester = NodeId::new(header.reserved);
        if requester.is_master() {
            trace!("address request with reserved id 0, dropping");
            return;
        }
        let request = match AddrRequest::from_bytes(payload) {
            Some(request) => request,
            None => {
                trace!(len = payload.len(), "short address request payload, dropping");
                return;
            }
        };

        // The poll node wrote its own address as the parent; when that is
        // the master's address the occupancy comes from our own child pipes.
        let (parent, mask) = if request.parent.is_empty() {
            (
                Addr::MASTER,
                ChildBitmap::from_raw(network.child_bit_field()),
            )
        } else {
            (request.parent, request.child_bitmap)
        };
        if !parent.is_valid_for(self.max_children) {
            trace!(%parent, "address request names an invalid parent, dropping");
            return;
        }
        stats.addr_requests_served += 1;

        for slot in mask.free_slots(self.max_children) {
            let candidate = parent.child(slot);
            if candidate.is_empty()
                || candidate.is_default()
                || !candidate.is_valid_for(self.max_children)
            {
                continue;
            }
            if table.taken_by_other(candidate, requester) {
                continue;
            }

            debug!(id = %requester, addr = %candidate, %parent, "offering address");
            self.send_offer(header, requester, candidate, clock, network);
            self.pending = Some(PendingOffer {
                id: requester,
                addr: candidate,
                armed_at: clock.millis(),
                timeout_ms: network.route_timeout_ms(),
            });
            stats.offers_sent += 1;
            return;
        }

        debug!(id = %requester, %parent, "no free child slot, dropping request");
    }

    /// Handle an address confirmation observed in the update dispatch.
    ///
    /// Returns the binding to commit when the confirmation matches the most
    /// recent offer and arrives within the route timeout.
    pub fn confirm(
        &mut self,
        src: Addr,
        now: u32,
        stats: &mut MeshStats,
    ) -> Option<(NodeId, Addr)> {
        let pending = self.pending.as_ref()?;
        if now.wrapping_sub(pending.armed_at) > pending.timeout_ms {
            trace!(id = %pending.id, addr = %pending.addr, "pending offer expired");
            self.pending = None;
            stats.offers_expired += 1;
            return None;
        }
        if pending.addr != src {
            return None;
        }
        let committed = (pending.id, pending.addr);
        self.pending = None;
        Some(committed)
    }

    /// Send the offer back along the reverse path: routed when the requester
    /// already holds an address, otherwise direct through the poll node
    /// that forwarded the request.
    fn send_offer<C: Clock, N: Network>(
        &self,
        header: &FrameHeader,
        requester: NodeId,
        candidate: Addr,
        clock: &C,
        network: &mut N,
    ) {
        let payload = candidate.raw().to_le_bytes();
        let mut response = FrameHeader {
            src_node: Addr::MASTER,
            dst_node: header.src_node,
            id: 0,
            msg_type: MessageType::AddrResponse,
            reserved: requester.as_u8(),
        };

        // Give the requester time to fall back into RX before the offer
        clock.delay_ms(10);

        if !header.src_node.is_default() {
            network.write(response, &payload);
        } else {
            response.dst_node = Addr::DEFAULT;
            network.write_direct(response, &payload, header.dst_node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NETWORK_ADDR_RESPONSE;
    use crate::traits::{DataRate, NetworkFlags, PowerLevel};
    use std::cell::{Cell, RefCell};

    struct MockClock {
        now: Cell<u32>,
    }

    impl MockClock {
        fn new() -> Self {
            Self { now: Cell::new(0) }
        }

        fn advance(&self, ms: u32) {
            self.now.set(self.now.get().wrapping_add(ms));
        }
    }

    impl Clock for MockClock {
        fn millis(&self) -> u32 {
            self.now.get()
        }

        fn delay_ms(&self, ms: u32) {
            self.advance(ms);
        }
    }

    #[derive(Debug)]
    struct MockNetwork {
        child_bits: u8,
        routed: RefCell<Vec<(FrameHeader, Vec<u8>)>>,
        direct: RefCell<Vec<(FrameHeader, Vec<u8>, Addr)>>,
    }

    impl MockNetwork {
        fn new(child_bits: u8) -> Self {
            Self {
                child_bits,
                routed: RefCell::new(Vec::new()),
                direct: RefCell::new(Vec::new()),
            }
        }
    }

    impl Network for MockNetwork {
        fn begin(&mut self, _: u8, _: Addr, _: DataRate, _: PowerLevel) -> bool {
            true
        }

        fn update(&mut self) -> MessageType {
            MessageType::Idle
        }

        fn frame_buffer(&self) -> &[u8] {
            &[]
        }

        fn write(&mut self, header: FrameHeader, payload: &[u8]) -> bool {
            self.routed.borrow_mut().push((header, payload.to_vec()));
            true
        }

        fn write_direct(&mut self, header: FrameHeader, payload: &[u8], direct_to: Addr) -> bool {
            self.direct
                .borrow_mut()
                .push((header, payload.to_vec(), direct_to));
            true
        }

        fn multicast(&mut self, _: FrameHeader, _: &[u8], _: u8) -> bool {
            true
        }

        fn set_address(&mut self, _: Addr) {}

        fn logical_address(&self) -> Addr {
            Addr::MASTER
        }

        fn is_valid_address(&self, addr: Addr) -> bool {
            addr.is_valid_for(4)
        }

        fn child_bit_field(&self) -> u8 {
            self.child_bits
        }

        fn route_timeout_ms(&self) -> u32 {
            100
        }

        fn set_return_sys_msgs(&mut self, _: bool) {}

        fn flags(&self) -> NetworkFlags {
            NetworkFlags::new()
        }

        fn set_flags(&mut self, _: NetworkFlags) {}
    }

    fn request_frame(requester: u8, src: Addr, dst: Addr) -> FrameHeader {
        FrameHeader {
            src_node: src,
            dst_node: dst,
            id: 1,
            msg_type: MessageType::ReqAddress,
            reserved: requester,
        }
    }

    fn direct_payload(parent: Addr, bitmap: u8) -> [u8; 4] {
        let mut request = AddrRequest::for_parent(parent);
        request.child_bitmap = ChildBitmap::from_raw(bitmap);
        request.to_bytes()
    }

    #[test]
    fn test_first_free_slot_under_master() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        // Unjoined requester: offer goes direct through the poll node
        let direct = network.direct.borrow();
        assert_eq!(direct.len(), 1);
        let (response, payload, direct_to) = &direct[0];
        assert_eq!(response.msg_type.value(), NETWORK_ADDR_RESPONSE);
        assert_eq!(response.reserved, 7);
        assert_eq!(response.dst_node, Addr::DEFAULT);
        assert_eq!(*direct_to, Addr::MASTER);
        assert_eq!(crate::message::read_u16_le(payload), Some(0o1));

        let pending = engine.pending().unwrap();
        assert_eq!(pending.id, NodeId::new(7));
        assert_eq!(pending.addr, Addr::from_raw(0o1));
        assert_eq!(stats.offers_sent, 1);
    }

    #[test]
    fn test_bitmap_skips_taken_slots() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        // Parent 01 with slot 1 occupied: the grandchild lands in slot 2
        let header = request_frame(11, Addr::DEFAULT, Addr::from_raw(0o1));
        let payload = direct_payload(Addr::from_raw(0o1), 0b01);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        assert_eq!(engine.pending().unwrap().addr, Addr::from_raw(0o21));
    }

    #[test]
    fn test_uniqueness_scan_advances_slot() {
        let mut engine = DhcpEngine::new(4);
        let mut table = BindingTable::new();
        // A stale bitmap may claim slot 1 is free while the table knows better
        table.assign(NodeId::new(9), Addr::from_raw(0o1));
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        assert_eq!(engine.pending().unwrap().addr, Addr::from_raw(0o2));
    }

    #[test]
    fn test_reoffer_same_id_reuses_slot() {
        let mut engine = DhcpEngine::new(4);
        let mut table = BindingTable::new();
        table.assign(NodeId::new(7), Addr::from_raw(0o1));
        table.release(Addr::from_raw(0o1));
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        assert_eq!(engine.pending().unwrap().addr, Addr::from_raw(0o1));
    }

    #[test]
    fn test_rejects_master_id() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(0, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        assert!(engine.pending().is_none());
        assert!(network.direct.borrow().is_empty());
        assert!(network.routed.borrow().is_empty());
    }

    #[test]
    fn test_drops_when_no_slot_free() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0b1111);
        let mut stats = MeshStats::default();

        let header = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        assert!(engine.pending().is_none());
        assert!(network.direct.borrow().is_empty());
        assert_eq!(stats.offers_sent, 0);
    }

    #[test]
    fn test_routed_response_for_joined_requester() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0b01);
        let mut stats = MeshStats::default();

        // Requester re-joins while still holding address 04
        let header = request_frame(7, Addr::from_raw(0o4), Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0b01);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        let routed = network.routed.borrow();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0.dst_node, Addr::from_raw(0o4));
        assert!(network.direct.borrow().is_empty());
    }

    #[test]
    fn test_two_phase_commit() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        // Confirmation from the wrong address does not commit
        assert!(engine
            .confirm(Addr::from_raw(0o2), clock.millis(), &mut stats)
            .is_none());
        assert!(engine.pending().is_some());

        let committed = engine
            .confirm(Addr::from_raw(0o1), clock.millis(), &mut stats)
            .unwrap();
        assert_eq!(committed, (NodeId::new(7), Addr::from_raw(0o1)));
        assert!(engine.pending().is_none());
    }

    #[test]
    fn test_confirmation_after_deadline_expires_offer() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let header = request_frame(13, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);

        clock.advance(network.route_timeout_ms() + 1);
        assert!(engine
            .confirm(Addr::from_raw(0o1), clock.millis(), &mut stats)
            .is_none());
        assert!(engine.pending().is_none());
        assert_eq!(stats.offers_expired, 1);

        // The same id may retry and be offered the same slot
        engine.process_request(&header, &payload, &table, &clock, &mut network, &mut stats);
        assert_eq!(engine.pending().unwrap().addr, Addr::from_raw(0o1));
    }

    #[test]
    fn test_new_offer_overwrites_pending() {
        let mut engine = DhcpEngine::new(4);
        let table = BindingTable::new();
        let clock = MockClock::new();
        let mut network = MockNetwork::new(0);
        let mut stats = MeshStats::default();

        let first = request_frame(7, Addr::DEFAULT, Addr::MASTER);
        let payload = direct_payload(Addr::MASTER, 0);
        engine.process_request(&first, &payload, &table, &clock, &mut network, &mut stats);

        let second = request_frame(9, Addr::DEFAULT, Addr::MASTER);
        engine.process_request(&second, &payload, &table, &clock, &mut network, &mut stats);

        // Only one outstanding offer is tracked
        assert_eq!(engine.pending().unwrap().id, NodeId::new(9));
    }
}
