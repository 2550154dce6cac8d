//! Data plane: per-network tables, NAT, the user-space L4 stack and the
//! switch pipeline tying them together

pub mod address_table;
pub mod aging;
pub mod conntrack;
mod filter;
pub mod mac_table;
pub mod nat;
pub mod neighbor_table;
mod network;
mod port;
pub mod route_table;
mod switch;

pub use address_table::{AddressTable, Cidr};
pub use conntrack::{Conntrack, FlowKey, TcpState};
pub use filter::{
    clamp_syn_mss, FilterHelper, FilterResult, MatchRule, MssRewrite, PacketContext,
    PacketFilter, RuleFilter,
};
pub use mac_table::MacTable;
pub use nat::{NatSession, NatTable, NatTimeouts, SNatPool};
pub use network::{Network, NetworkTimeouts};
pub use port::{Port, DEFAULT_MTU};
pub use route_table::{RouteRule, RouteTarget};
pub use switch::{Switch, SwitchSettings, DEFAULT_HOP_LIMIT};
