//! NextGCore SMF session core
//!
//! PDU session management between the AMF and the user plane:
//! - Topology of access nodes and UPFs, UE address pools and data paths
//! - Per-node PDR/FAR/QER/BAR registries synchronized over N4 (PFCP)
//! - The SM context state machine with its single PFCP outcome channel
//! - Create, update and release of SM contexts as the AMF drives them
//! - Uplink classifier branches towards pre-configured second anchors
//!
//! SBI transport to the PCF, UDM, NRF and AMF stays behind the traits in
//! [`consumer`].

pub mod config;
pub mod consumer;
pub mod context;
pub mod datapath;
pub mod error;
pub mod gsm;
pub mod n4_build;
pub mod n4_handler;
pub mod pfcp_path;
pub mod pfcp_sm;
pub mod pool;
pub mod producer;
pub mod registry;
pub mod rule;
pub mod sess_sm;
pub mod timer;
pub mod topology;
pub mod ulcl;

#[cfg(test)]
mod property_tests;

pub use config::SmfConfig;
pub use consumer::Collaborators;
pub use context::{SessionHandle, SmContext, SmfContext};
pub use error::{SmfError, SmfResult};
pub use producer::{
    CreateSmContextRequest, CreateSmContextResponse, N2SmInfo, ReleaseSmContextResponse,
    UpdateSmContextRequest, UpdateSmContextResponse,
};
