/*!
Wire messages of the nyx overlay protocol.

Every message is a bencoded dictionary carrying a `V` protocol version and
an `A` message tag; dictionary keys are emitted in ascending byte order.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate cookie_factory;

pub mod dht;
pub mod errors;
pub mod link;
pub mod lr_commit;
pub mod relay;
pub mod router_contact;
pub mod routing;

/// Protocol version carried in the `V` key of every wire dictionary.
pub const PROTO_VERSION: u64 = 0;

/// Upper bound on a single link-layer message.
pub const MAX_LINK_MSG_SIZE: usize = 8192;

/// Routing messages are right-padded with random bytes up to this size
/// before onion wrapping so every message looks alike.
pub const MESSAGE_PAD_SIZE: usize = 128;

/// Number of frames in an LR Commit message, one per possible hop.
pub const MAX_HOPS: usize = 8;
