#![doc = include_str!("../README.md")]

mod common;
pub mod ranges;
pub mod store;

pub use common::*;
pub use ranges::{NetworkRangeProvider, StaticNetworkRanges};
pub use store::{AllocationStore, memory::MemoryStore};
