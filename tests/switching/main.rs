//! Switch integration tests over in-memory ports
//!
//! Run with: cargo test --test switching

mod filters;
mod harness;
mod l2;
mod l4;
mod nat;
mod neighbors;
mod routing;
