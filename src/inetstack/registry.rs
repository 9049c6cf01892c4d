// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process-wide registries of protocol factories and link endpoints. The
//! embedder registers protocols explicitly (each protocol module exposes a
//! `register()` hook) before calling `Stack::new`.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::types::{
    LinkEndpoint,
    LinkEndpointId,
    NetworkProtocol,
    TransportProtocol,
};
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        OnceLock,
    },
};

//==============================================================================
// Structures
//==============================================================================

pub type NetworkProtocolFactory = fn() -> Arc<dyn NetworkProtocol>;
pub type TransportProtocolFactory = fn() -> Arc<dyn TransportProtocol>;

struct LinkRegistry {
    next_id: LinkEndpointId,
    endpoints: HashMap<LinkEndpointId, Arc<dyn LinkEndpoint>>,
}

//==============================================================================
// Static Variables
//==============================================================================

static NETWORK_PROTOCOLS: OnceLock<Mutex<HashMap<String, NetworkProtocolFactory>>> = OnceLock::new();
static TRANSPORT_PROTOCOLS: OnceLock<Mutex<HashMap<String, TransportProtocolFactory>>> = OnceLock::new();
static LINK_ENDPOINTS: OnceLock<Mutex<LinkRegistry>> = OnceLock::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Registers a network protocol factory under the given name.
pub fn register_network_protocol_factory(name: &str, factory: NetworkProtocolFactory) {
    let registry = NETWORK_PROTOCOLS.get_or_init(|| Mutex::new(HashMap::new()));
    registry.lock().unwrap().insert(name.to_string(), factory);
}

/// Looks up a network protocol factory by name.
pub fn network_protocol_factory(name: &str) -> Option<NetworkProtocolFactory> {
    let registry = NETWORK_PROTOCOLS.get_or_init(|| Mutex::new(HashMap::new()));
    registry.lock().unwrap().get(name).copied()
}

/// Registers a transport protocol factory under the given name.
pub fn register_transport_protocol_factory(name: &str, factory: TransportProtocolFactory) {
    let registry = TRANSPORT_PROTOCOLS.get_or_init(|| Mutex::new(HashMap::new()));
    registry.lock().unwrap().insert(name.to_string(), factory);
}

/// Looks up a transport protocol factory by name.
pub fn transport_protocol_factory(name: &str) -> Option<TransportProtocolFactory> {
    let registry = TRANSPORT_PROTOCOLS.get_or_init(|| Mutex::new(HashMap::new()));
    registry.lock().unwrap().get(name).copied()
}

/// Registers a link endpoint and returns the id a NIC can be created with.
pub fn register_link_endpoint(ep: Arc<dyn LinkEndpoint>) -> LinkEndpointId {
    let registry = LINK_ENDPOINTS.get_or_init(|| {
        Mutex::new(LinkRegistry {
            next_id: 1,
            endpoints: HashMap::new(),
        })
    });
    let mut registry = registry.lock().unwrap();
    let id: LinkEndpointId = registry.next_id;
    registry.next_id += 1;
    registry.endpoints.insert(id, ep);
    id
}

/// Looks up a registered link endpoint.
pub fn find_link_endpoint(id: LinkEndpointId) -> Option<Arc<dyn LinkEndpoint>> {
    let registry = LINK_ENDPOINTS.get_or_init(|| {
        Mutex::new(LinkRegistry {
            next_id: 1,
            endpoints: HashMap::new(),
        })
    });
    let registry = registry.lock().unwrap();
    registry.endpoints.get(&id).cloned()
}
