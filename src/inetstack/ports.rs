// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Allocation, reservation, and release of transport ports.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    inetstack::types::{
        Address,
        NetworkProtocolNumber,
        TransportProtocolNumber,
    },
    runtime::fail::Fail,
};
use ::rand::Rng;
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Mutex,
};

//==============================================================================
// Constants
//==============================================================================

/// The first ephemeral port.
const FIRST_EPHEMERAL: u16 = 16000;

//==============================================================================
// Structures
//==============================================================================

#[derive(Clone, Eq, Hash, PartialEq)]
struct PortDescriptor {
    network: NetworkProtocolNumber,
    transport: TransportProtocolNumber,
    port: u16,
}

/// Manages reservations of `(network-protocol, transport-protocol,
/// local-address, local-port)` tuples. Reservations are global to the stack.
pub struct PortManager {
    allocated: Mutex<HashMap<PortDescriptor, HashSet<Address>>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl PortManager {
    pub fn new() -> Self {
        Self {
            allocated: Mutex::new(HashMap::new()),
        }
    }

    /// Randomly chooses a starting point and iterates over all possible
    /// ephemeral ports, letting the caller decide whether a given port is
    /// suitable, and stopping when a port is found or an error occurs.
    pub fn pick_ephemeral_port<F>(&self, mut test_port: F) -> Result<u16, Fail>
    where
        F: FnMut(u16) -> Result<bool, Fail>,
    {
        let count: u32 = u32::from(u16::MAX - FIRST_EPHEMERAL) + 1;
        let offset: u32 = ::rand::thread_rng().gen_range(0..count);

        for i in 0..count {
            let port: u16 = FIRST_EPHEMERAL + ((offset + i) % count) as u16;
            if test_port(port)? {
                return Ok(port);
            }
            // The port is taken, try the next one.
        }

        Err(Fail::NoPortAvailable)
    }

    /// Reserves `port` for `addr` under every requested network protocol.
    /// A zero port requests an ephemeral one. On success the chosen port is
    /// returned; partial reservations are rolled back on failure.
    pub fn reserve_port(
        &self,
        net_protos: &[NetworkProtocolNumber],
        trans_proto: TransportProtocolNumber,
        addr: &Address,
        port: u16,
    ) -> Result<u16, Fail> {
        let mut allocated = self.allocated.lock().unwrap();

        if port != 0 {
            if !Self::reserve_locked(&mut allocated, net_protos, trans_proto, addr, port) {
                return Err(Fail::PortInUse);
            }
            return Ok(port);
        }

        drop(allocated);
        self.pick_ephemeral_port(|p| {
            let mut allocated = self.allocated.lock().unwrap();
            Ok(Self::reserve_locked(&mut allocated, net_protos, trans_proto, addr, p))
        })
    }

    /// Undoes a reservation made by `reserve_port`. Empty sets prune their
    /// map keys.
    pub fn release_port(
        &self,
        net_protos: &[NetworkProtocolNumber],
        trans_proto: TransportProtocolNumber,
        addr: &Address,
        port: u16,
    ) {
        let mut allocated = self.allocated.lock().unwrap();
        for network in net_protos {
            let desc: PortDescriptor = PortDescriptor {
                network: *network,
                transport: trans_proto,
                port,
            };
            if let Some(addrs) = allocated.get_mut(&desc) {
                addrs.remove(addr);
                if addrs.is_empty() {
                    allocated.remove(&desc);
                }
            }
        }
    }

    /// `addr` is free iff the set is empty, or the wildcard is absent and
    /// `addr` itself is absent. The wildcard binds exclusively.
    fn is_available_locked(
        allocated: &HashMap<PortDescriptor, HashSet<Address>>,
        desc: &PortDescriptor,
        addr: &Address,
    ) -> bool {
        match allocated.get(desc) {
            None => true,
            Some(addrs) if addrs.is_empty() => true,
            Some(addrs) => {
                if addr.is_empty() {
                    // The wildcard tolerates no other binding.
                    return false;
                }
                !addrs.contains(&Address::empty()) && !addrs.contains(addr)
            },
        }
    }

    fn reserve_locked(
        allocated: &mut HashMap<PortDescriptor, HashSet<Address>>,
        net_protos: &[NetworkProtocolNumber],
        trans_proto: TransportProtocolNumber,
        addr: &Address,
        port: u16,
    ) -> bool {
        for network in net_protos {
            let desc: PortDescriptor = PortDescriptor {
                network: *network,
                transport: trans_proto,
                port,
            };
            if !Self::is_available_locked(allocated, &desc, addr) {
                return false;
            }
        }

        // The port is free under every requested protocol; bind it.
        for network in net_protos {
            let desc: PortDescriptor = PortDescriptor {
                network: *network,
                transport: trans_proto,
                port,
            };
            allocated.entry(desc).or_insert_with(HashSet::new).insert(addr.clone());
        }

        true
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
