//! This crate re-exports all nyx crates.

pub use nyx_binary_io as binary_io;
pub use nyx_core as core;
pub use nyx_crypto as crypto;
pub use nyx_packet as packet;

pub fn crate_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
