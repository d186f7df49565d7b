//! Mesh façade
//!
//! Drives the periodic update pump, dispatches inbound control messages to
//! the binding table, resolver, and DHCP engine, and exposes the public
//! addressing API. One `Mesh` owns one node's worth of state; the radio and
//! network capability values are injected at construction.
//!
//! ## Division of labor
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Mesh                              │
//! │  update() ── classify ──┬─ lookups / release / confirm    │
//! │                         └─ latch address requests         │
//! │  dhcp()   ── consume latched request ──► DhcpEngine       │
//! │  renew_address() ──────────────────────► join machine     │
//! │  get_address()/get_node_id() ──────────► resolver         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! `update()` must be called at regular intervals; on the master, `dhcp()`
//! should be called right after it so latched address requests are served
//! outside the receive path.

use crate::address::{Addr, NodeId};
use crate::config::{
    ADDR_LOOKUP_TIMEOUT_MS, ID_LOOKUP_TIMEOUT_MS, LOOKUP_RETRY_DELAY_MS, MeshConfig,
    PING_ATTEMPTS, PING_SPACING_MS,
};
use crate::dhcp::DhcpEngine;
use crate::error::{MeshError, MeshResult};
use crate::join;
use crate::message::{read_i16_le, read_u16_le, FrameHeader, MessageType, LOOKUP_NOT_FOUND};
use crate::table::BindingTable;
use crate::traits::{Clock, Network, Radio};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Counters for mesh addressing activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshStats {
    /// Discovery polls multicast by this node
    pub polls_sent: u64,
    /// Contacts that answered our polls
    pub contacts_heard: u64,
    /// Address requests sent through contacts
    pub addr_requests_sent: u64,
    /// Successful address renewals
    pub renewals_completed: u64,
    /// Address requests processed by the DHCP engine (master)
    pub addr_requests_served: u64,
    /// Address offers sent (master)
    pub offers_sent: u64,
    /// Offers that aged out unconfirmed (master)
    pub offers_expired: u64,
    /// Bindings committed after confirmation (master)
    pub bindings_committed: u64,
    /// Lookup requests answered (master)
    pub lookups_served: u64,
    /// Release requests honored (master)
    pub releases_handled: u64,
}

/// The mesh addressing layer for one node
#[derive(Debug)]
pub struct Mesh<C: Clock, R: Radio, N: Network> {
    clock: C,
    radio: R,
    network: N,
    config: MeshConfig,
    node_id: NodeId,
    mesh_address: Addr,
    last_error: Option<MeshError>,
    table: BindingTable,
    dhcp: DhcpEngine,
    dhcp_pending: bool,
    dhcp_header: FrameHeader,
    dhcp_payload: Vec<u8>,
    stats: MeshStats,
}

impl<C: Clock, R: Radio, N: Network> Mesh<C, R, N> {
    /// Create a mesh node from its capability values and configuration.
    /// Nothing touches the radio until [`Mesh::begin`].
    pub fn new(clock: C, radio: R, network: N, config: MeshConfig) -> Self {
        let node_id = config.node_id;
        let max_children = config.max_children;
        Self {
            clock,
            radio,
            network,
            node_id,
            mesh_address: Addr::DEFAULT,
            last_error: None,
            table: BindingTable::new(),
            dhcp: DhcpEngine::new(max_children),
            dhcp_pending: false,
            dhcp_header: FrameHeader::to_node(Addr::MASTER, MessageType::Idle),
            dhcp_payload: Vec::with_capacity(32),
            stats: MeshStats::default(),
            config,
        }
    }

    /// Configure the radio and network and bring this node onto the mesh.
    ///
    /// A node with id 0 assumes the master role: it installs address 0 and
    /// an empty binding table. Any other node acquires an address from the
    /// master within the configured renewal budget.
    pub fn begin(&mut self) -> MeshResult<()> {
        if self.config.channel == 0 || self.config.channel > 127 {
            return Err(self.fail(MeshError::InvalidParam));
        }
        if !self.network.begin(
            self.config.channel,
            Addr::DEFAULT,
            self.config.data_rate,
            self.config.power,
        ) {
            return Err(self.fail(MeshError::FailedInit));
        }
        self.mesh_address = Addr::DEFAULT;
        self.network.set_return_sys_msgs(true);

        if self.node_id.is_master() {
            debug!("initializing master node");
            self.table = BindingTable::new();
            self.mesh_address = Addr::MASTER;
            self.network.set_address(Addr::MASTER);
            Ok(())
        } else {
            debug!(id = %self.node_id, "initializing mesh node");
            self.renew_address(self.config.renewal_timeout_ms)?;
            Ok(())
        }
    }

    /// Pump the network layer and classify the surfaced frame.
    ///
    /// On the master, lookup, release, and confirmation messages are served
    /// synchronously. Address requests and offers are latched for
    /// [`Mesh::dhcp`] on every node so the engine can run outside the
    /// receive path.
    pub fn update(&mut self) -> MessageType {
        let msg = self.network.update();
        if self.mesh_address.is_default() {
            return msg;
        }

        match msg {
            MessageType::ReqAddress | MessageType::AddrResponse => self.latch_dhcp_frame(),
            _ => {}
        }

        if self.node_id.is_master() {
            match msg {
                MessageType::AddrLookup | MessageType::IdLookup => self.serve_lookup(msg),
                MessageType::AddrRelease => self.serve_release(),
                MessageType::AddrConfirm => self.serve_confirm(),
                _ => {}
            }
        }

        msg
    }

    /// Run the DHCP engine against the frame latched by [`Mesh::update`].
    pub fn dhcp(&mut self) {
        if !self.dhcp_pending {
            return;
        }
        self.dhcp_pending = false;

        match self.dhcp_header.msg_type {
            MessageType::ReqAddress if self.node_id.is_master() => {
                self.dhcp.process_request(
                    &self.dhcp_header,
                    &self.dhcp_payload,
                    &self.table,
                    &self.clock,
                    &mut self.network,
                    &mut self.stats,
                );
            }
            MessageType::AddrResponse => {
                // Offer relay to unjoined descendants is the network
                // layer's job; nothing to forward from here.
            }
            _ => {}
        }
    }

    /// Send `payload` to the node named by `node_id` (0 = master),
    /// resolving the destination address first.
    pub fn write(
        &mut self,
        payload: &[u8],
        msg_type: MessageType,
        node_id: NodeId,
    ) -> MeshResult<()> {
        if self.mesh_address.is_default() {
            return Err(self.fail(MeshError::NotConfigured));
        }

        let mut to_node = Addr::MASTER;
        if !node_id.is_master() {
            let start = self.clock.millis();
            let mut retry_delay = LOOKUP_RETRY_DELAY_MS;
            loop {
                match self.get_address(node_id) {
                    Ok(addr) => {
                        to_node = addr;
                        break;
                    }
                    // The master answered: the id does not exist
                    Err(MeshError::NotFound) => return Err(self.fail(MeshError::NotFound)),
                    Err(_) => {
                        if self.clock.since(start) > self.config.lookup_timeout_ms {
                            return Err(self.fail(MeshError::FailedAddrLookup));
                        }
                        self.clock.delay_ms(retry_delay);
                        retry_delay += LOOKUP_RETRY_DELAY_MS;
                    }
                }
            }
        }

        self.write_to(to_node, payload, msg_type)
    }

    /// Send `payload` directly to a logical address.
    pub fn write_to(&mut self, addr: Addr, payload: &[u8], msg_type: MessageType) -> MeshResult<()> {
        if self.mesh_address.is_default() {
            return Err(self.fail(MeshError::NotConfigured));
        }
        let header = FrameHeader::to_node(addr, msg_type);
        if self.network.write(header, payload) {
            Ok(())
        } else {
            Err(self.fail(MeshError::FailedWrite))
        }
    }

    /// Probe connectivity to the master.
    ///
    /// Succeeds when the receive fifo is already full, incoming frames are
    /// being held, or a ping write goes through. On failure the radio is
    /// left in standby; on success it is listening.
    pub fn check_connection(&mut self) -> bool {
        let mut attempts = PING_ATTEMPTS;
        let mut connected = false;

        while attempts > 0 && !self.mesh_address.is_default() {
            attempts -= 1;
            self.update();

            if self.radio.rx_fifo_full() || self.network.flags().hold_incoming() {
                connected = true;
                break;
            }

            let ping = FrameHeader::to_node(Addr::MASTER, MessageType::Ping);
            if self.network.write(ping, &[]) {
                connected = true;
                break;
            }
            self.clock.delay_ms(PING_SPACING_MS);
        }

        if connected {
            self.radio.start_listening();
        } else {
            self.radio.stop_listening();
        }
        connected
    }

    /// Drop the current address and acquire a fresh one from the master.
    pub fn renew_address(&mut self, timeout_ms: u32) -> MeshResult<Addr> {
        match join::renew_address(
            &self.clock,
            &mut self.radio,
            &mut self.network,
            self.node_id,
            timeout_ms,
            &mut self.stats,
        ) {
            Ok(addr) => {
                self.mesh_address = addr;
                self.last_error = None;
                debug!(id = %self.node_id, addr = %addr, "joined mesh");
                Ok(addr)
            }
            Err(err) => {
                self.mesh_address = Addr::DEFAULT;
                Err(self.fail(err))
            }
        }
    }

    /// Hand the current address back to the master and go un-joined.
    pub fn release_address(&mut self) -> MeshResult<()> {
        if self.mesh_address.is_default() {
            return Err(self.fail(MeshError::NotConfigured));
        }
        let header = FrameHeader::to_node(Addr::MASTER, MessageType::AddrRelease);
        if self.network.write(header, &[]) {
            self.network.set_address(Addr::DEFAULT);
            self.mesh_address = Addr::DEFAULT;
            Ok(())
        } else {
            Err(self.fail(MeshError::FailedWrite))
        }
    }

    /// Resolve a node id to its logical address.
    ///
    /// Local on the master; a wire lookup elsewhere. [`MeshError::NotFound`]
    /// means the master answered and the id is unknown.
    pub fn get_address(&mut self, node_id: NodeId) -> MeshResult<Addr> {
        if self.node_id.is_master() {
            return match self.table.address_of(node_id) {
                Some(addr) => Ok(addr),
                None if node_id.is_master() => Ok(Addr::MASTER),
                None => Err(self.fail(MeshError::NotFound)),
            };
        }
        if self.mesh_address.is_default() {
            return Err(self.fail(MeshError::NotConfigured));
        }
        if node_id.is_master() {
            return Ok(Addr::MASTER);
        }

        let header = FrameHeader::to_node(Addr::MASTER, MessageType::AddrLookup);
        if !self.network.write(header, &[node_id.as_u8()]) {
            return Err(self.fail(MeshError::FailedWrite));
        }

        let start = self.clock.millis();
        while self.network.update() != MessageType::AddrLookup {
            if self.clock.since(start) > ADDR_LOOKUP_TIMEOUT_MS {
                return Err(self.fail(MeshError::FailedAddrLookup));
            }
        }

        let result = self
            .network
            .frame_buffer()
            .get(FrameHeader::SIZE..)
            .and_then(read_i16_le);
        match result {
            Some(value) if value >= 0 => Ok(Addr::from_raw(value as u16)),
            Some(_) => Err(self.fail(MeshError::NotFound)),
            None => Err(self.fail(MeshError::FailedAddrLookup)),
        }
    }

    /// Resolve a logical address to a node id; `None` returns the local id.
    pub fn get_node_id(&mut self, addr: Option<Addr>) -> MeshResult<NodeId> {
        let addr = match addr {
            None => return Ok(self.node_id),
            Some(addr) if addr == Addr::MASTER => return Ok(NodeId::MASTER),
            Some(addr) => addr,
        };

        if self.node_id.is_master() {
            return match self.table.id_at(addr) {
                Some(id) => Ok(id),
                None => Err(self.fail(MeshError::NotFound)),
            };
        }
        if self.mesh_address.is_default() {
            return Err(self.fail(MeshError::NotConfigured));
        }

        let header = FrameHeader::to_node(Addr::MASTER, MessageType::IdLookup);
        if !self.network.write(header, &addr.raw().to_le_bytes()) {
            return Err(self.fail(MeshError::FailedWrite));
        }

        let start = self.clock.millis();
        while self.network.update() != MessageType::IdLookup {
            if self.clock.since(start) > ID_LOOKUP_TIMEOUT_MS {
                return Err(self.fail(MeshError::Timeout));
            }
        }

        let result = self
            .network
            .frame_buffer()
            .get(FrameHeader::SIZE..)
            .and_then(read_i16_le);
        match result {
            Some(value) if value >= 0 => Ok(NodeId::new(value as u8)),
            Some(_) => Err(self.fail(MeshError::NotFound)),
            None => Err(self.fail(MeshError::Timeout)),
        }
    }

    /// Set this node's stable identifier; call before [`Mesh::begin`].
    pub fn set_node_id(&mut self, id: NodeId) {
        self.node_id = id;
    }

    /// Change the radio channel and resume listening.
    pub fn set_channel(&mut self, channel: u8) {
        self.config.channel = channel;
        self.radio.set_channel(channel);
        self.radio.start_listening();
    }

    /// Allow or refuse child nodes attaching below this node.
    pub fn set_child(&mut self, allow: bool) {
        let mut flags = self.network.flags();
        flags.set_no_poll(!allow);
        self.network.set_flags(flags);
    }

    /// Administratively insert or replace a binding (master only).
    pub fn set_address(&mut self, id: NodeId, addr: Addr) {
        self.table.assign(id, addr);
    }

    /// This node's stable identifier
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The current logical address (`Addr::DEFAULT` when un-joined)
    pub fn mesh_address(&self) -> Addr {
        self.mesh_address
    }

    /// The most recent error latched by a failed operation
    pub fn last_error(&self) -> Option<MeshError> {
        self.last_error
    }

    /// Addressing activity counters
    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// The master's binding table (empty on other nodes)
    pub fn binding_table(&self) -> &BindingTable {
        &self.table
    }

    fn fail(&mut self, err: MeshError) -> MeshError {
        self.last_error = Some(err);
        err
    }

    /// Copy the surfaced frame aside so the DHCP engine can consume it
    /// outside the update loop.
    fn latch_dhcp_frame(&mut self) {
        if let Some(header) = FrameHeader::from_bytes(self.network.frame_buffer()) {
            self.dhcp_header = header;
            self.dhcp_payload.clear();
            self.dhcp_payload
                .extend_from_slice(&self.network.frame_buffer()[FrameHeader::SIZE..]);
            self.dhcp_pending = true;
        }
    }

    /// Answer an id→address or address→id lookup from the binding table.
    fn serve_lookup(&mut self, msg: MessageType) {
        let reply = {
            let frame = self.network.frame_buffer();
            let header = match FrameHeader::from_bytes(frame) {
                Some(header) => header,
                None => return,
            };
            let payload = &frame[FrameHeader::SIZE..];

            let result: i16 = if msg == MessageType::AddrLookup {
                let id = match payload.first() {
                    Some(&id) => NodeId::new(id),
                    None => return,
                };
                if id.is_master() {
                    0
                } else {
                    match self.table.address_of(id) {
                        Some(addr) => addr.raw() as i16,
                        None => LOOKUP_NOT_FOUND,
                    }
                }
            } else {
                let addr = match read_u16_le(payload) {
                    Some(addr) => Addr::from_raw(addr),
                    None => return,
                };
                if addr.is_empty() {
                    0
                } else {
                    match self.table.id_at(addr) {
                        Some(id) => i16::from(id.as_u8()),
                        None => LOOKUP_NOT_FOUND,
                    }
                }
            };

            let mut response = header;
            response.src_node = Addr::MASTER;
            response.dst_node = header.src_node;
            response.id = 0;
            (response, result)
        };

        trace!(to = %reply.0.dst_node, result = reply.1, "lookup served");
        self.network.write(reply.0, &reply.1.to_le_bytes());
        self.stats.lookups_served += 1;
    }

    /// Clear every binding held by the releasing node.
    fn serve_release(&mut self) {
        if let Some(header) = FrameHeader::from_bytes(self.network.frame_buffer()) {
            let cleared = self.table.release(header.src_node);
            if cleared > 0 {
                debug!(addr = %header.src_node, "address released");
                self.stats.releases_handled += 1;
            }
        }
    }

    /// Commit the pending offer when the confirmation matches it.
    fn serve_confirm(&mut self) {
        if let Some(header) = FrameHeader::from_bytes(self.network.frame_buffer()) {
            let now = self.clock.millis();
            if let Some((id, addr)) = self.dhcp.confirm(header.src_node, now, &mut self.stats) {
                self.table.assign(id, addr);
                self.stats.bindings_committed += 1;
                debug!(id = %id, addr = %addr, "binding committed");
            }
        }
    }
}
