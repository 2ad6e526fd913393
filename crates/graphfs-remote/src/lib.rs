//! GraphFS Remote: SuperBlock backed by a remote authority
//!
//! Plugs into a [`graphfs_core::VirtualGraph`] like any other backend: hand
//! [`RemoteSuperBlock::provider`] a [`RemoteDriver`] and partitions are
//! served read-through from whatever sits behind it. The local side never
//! mutates; writes, edge changes and creates fail with `Unsupported`.
//!
//! The transport is the driver's business. [`LoopbackDriver`] answers from
//! local superblocks while still encoding every message, which is how the
//! adapter is tested without a network.

pub mod driver;
pub mod remote;
pub mod wire;

pub use driver::{serve, LoopbackDriver, RemoteDriver};
pub use remote::RemoteSuperBlock;
pub use wire::{Fault, FaultKind, Request, Response};
