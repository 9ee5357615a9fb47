//! Device pairing
//!
//! A device presenting an identity at `connect` must be paired before it may
//! use the gateway. Unknown devices queue a [`PairingRequest`] for an
//! operator; the request is valid for two minutes and is consumed exactly
//! once. Previously paired devices that no longer verify queue a repair
//! request instead, which a local client may auto-approve (see [`repair`]).
//!
//! [`PairingRequest`]: crate::gateway::protocol::PairingRequest

pub mod repair;
pub mod store;

pub use repair::{
    call_gateway_with_repair_approval, decide_repair, find_repair_candidate, is_pairing_required_error,
    GatewayCaller, GatewayRepairError, PairingAdmin, RepairDecision, RepairFlowError, REPAIR_MAX_AGE_MS,
};
pub use store::{DeviceVerdict, NewPairingRequest, PairingStore, PAIRING_REQUEST_TTL_MS};
