//! Address acquisition for non-master nodes
//!
//! One renewal walks through discovery, request, and confirmation against
//! the contacts that answer a level poll:
//!
//! 1. Multicast a poll to one tree level and collect up to `MAX_POLLS`
//!    responding contacts.
//! 2. Ask each contact to relay an address request to the master, naming
//!    the contact as the prospective parent.
//! 3. Validate the returned offer (non-zero address, echoed node id).
//! 4. Confirm the offer to the master and adopt the address.
//!
//! Failed attempts rotate the poll level and back off arithmetically until
//! the caller's renewal budget runs out. Every wait is bounded; every write
//! may fail silently and is absorbed by the retry loop.

use crate::address::{Addr, NodeId};
use crate::config::{
    ADDR_RESPONSE_TIMEOUT_MS, CONFIRM_RETRIES, CONFIRM_RETRY_DELAY_MS, CONTACT_PAUSE_MS,
    MAX_POLLS, POLL_TIMEOUT_MS,
};
use crate::error::{MeshError, MeshResult};
use crate::mesh::MeshStats;
use crate::message::{read_u16_le, AddrRequest, FrameHeader, MessageType};
use crate::traits::{Clock, Network, Radio};
use tracing::{debug, trace};

/// Backoff between failed acquisition attempts, in milliseconds.
///
/// Grows with both the per-cycle attempt counter (which also selects the
/// poll level) and the total attempt counter.
pub(crate) fn backoff_delay_ms(total_reqs: u8, req_counter: u8) -> u32 {
    50 + u32::from(total_reqs + 1) * u32::from(req_counter + 1) * 2
}

/// Acquire a fresh address from the master, retrying until `timeout_ms`
/// elapses. On success the network layer has already adopted the address.
pub(crate) fn renew_address<C: Clock, R: Radio, N: Network>(
    clock: &C,
    radio: &mut R,
    network: &mut N,
    node_id: NodeId,
    timeout_ms: u32,
    stats: &mut MeshStats,
) -> MeshResult<Addr> {
    // The radio must be drained before we abandon our current address
    if radio.available() {
        return Err(MeshError::PendingData);
    }

    radio.stop_listening();

    // Holds would block the control exchange; bypass them for the duration
    let mut flags = network.flags();
    flags.set_bypass_holds(true);
    network.set_flags(flags);
    clock.delay_ms(10);

    network.set_address(Addr::DEFAULT);

    let mut req_counter: u8 = 0;
    let mut total_reqs: u8 = 0;
    let start = clock.millis();
    let result = loop {
        match request_address(clock, radio, network, node_id, req_counter, stats) {
            Ok(addr) => break Ok(addr),
            Err(err) => {
                trace!(%err, level = req_counter, "acquisition attempt failed");
                if clock.since(start) > timeout_ms {
                    break Err(MeshError::Timeout);
                }
                clock.delay_ms(backoff_delay_ms(total_reqs, req_counter));
                req_counter = (req_counter + 1) % 4;
                total_reqs = (total_reqs + 1) % 10;
            }
        }
    };

    let mut flags = network.flags();
    flags.set_bypass_holds(false);
    network.set_flags(flags);

    result
}

/// One acquisition attempt against the given poll level.
fn request_address<C: Clock, R: Radio, N: Network>(
    clock: &C,
    radio: &mut R,
    network: &mut N,
    node_id: NodeId,
    level: u8,
    stats: &mut MeshStats,
) -> MeshResult<Addr> {
    // Reach out to any radio at this tree level
    let poll = FrameHeader::to_node(Addr::MULTICAST, MessageType::Poll);
    network.multicast(poll, &[], level);
    stats.polls_sent += 1;

    let mut contacts = [Addr::DEFAULT; MAX_POLLS];
    let mut contact_count = 0usize;
    let poll_start = clock.millis();
    while clock.since(poll_start) <= POLL_TIMEOUT_MS && contact_count < MAX_POLLS {
        if network.update() == MessageType::Poll {
            // A poll response carries the responder's logical address
            if let Some(header) = FrameHeader::from_bytes(network.frame_buffer()) {
                contacts[contact_count] = header.src_node;
                contact_count += 1;
            }
        }
    }
    if contact_count == 0 {
        trace!(level, "no poll response");
        return Err(MeshError::PollFail);
    }
    stats.contacts_heard += contact_count as u64;
    debug!(level, contacts = contact_count, "poll answered");

    // Ask each contact in turn to relay an address request
    let mut response_seen = false;
    'contacts: for contact in contacts.iter().take(contact_count) {
        if !network.is_valid_address(*contact) {
            continue;
        }

        let request = AddrRequest::for_parent(*contact);
        let header = FrameHeader {
            src_node: network.logical_address(),
            dst_node: *contact,
            id: 0,
            msg_type: MessageType::ReqAddress,
            reserved: node_id.as_u8(),
        };
        network.write_direct(header, &request.to_bytes(), *contact);
        stats.addr_requests_sent += 1;
        trace!(contact = %contact, "address requested");

        let wait_start = clock.millis();
        while clock.since(wait_start) < ADDR_RESPONSE_TIMEOUT_MS {
            if network.update() == MessageType::AddrResponse {
                response_seen = true;
                break 'contacts;
            }
        }
        clock.delay_ms(CONTACT_PAUSE_MS);
    }
    if !response_seen {
        return Err(MeshError::NoResponse);
    }

    // Validate the offer before adopting anything
    let frame = network.frame_buffer();
    let header = match FrameHeader::from_bytes(frame) {
        Some(header) => header,
        None => return Err(MeshError::FailedAddrRequest),
    };
    let offered = match frame
        .get(FrameHeader::SIZE..)
        .and_then(read_u16_le)
        .map(Addr::from_raw)
    {
        Some(offered) => offered,
        None => return Err(MeshError::FailedAddrRequest),
    };
    if offered.is_empty() || header.reserved != node_id.as_u8() {
        trace!(addr = %offered, for_id = header.reserved, "offer discarded");
        return Err(MeshError::FailedAddrRequest);
    }

    // Adopt the address, then verify it back to the master
    radio.stop_listening();
    clock.delay_ms(10);
    network.set_address(offered);

    let confirm = FrameHeader {
        src_node: offered,
        dst_node: Addr::MASTER,
        id: 0,
        msg_type: MessageType::AddrConfirm,
        reserved: node_id.as_u8(),
    };
    let mut attempts = 0u8;
    while !network.write(confirm, &[]) {
        attempts += 1;
        if attempts >= CONFIRM_RETRIES {
            network.set_address(Addr::DEFAULT);
            return Err(MeshError::FailedAddrConfirm);
        }
        clock.delay_ms(CONFIRM_RETRY_DELAY_MS);
    }

    debug!(addr = %offered, "address confirmed");
    stats.renewals_completed += 1;
    Ok(offered)
}
