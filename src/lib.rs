//! vswitch - user-space software-defined switch
//!
//! Multiplexes virtual ports into isolated broadcast domains keyed by a
//! virtual network identifier (VNI). Each network learns MAC addresses,
//! answers ARP/NDP/ICMP for the addresses it owns, routes between networks,
//! translates addresses through SNAT pools and runs a small user-space TCP
//! stack for the services it terminates.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
