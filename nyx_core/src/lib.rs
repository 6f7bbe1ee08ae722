/*!
Core logic of a nyx overlay node.

The crate is layered bottom-up: [`nodedb`](./nodedb/index.html) stores
verified router descriptors, [`dht`](./dht/index.html) resolves routers by
key, [`path`](./path/index.html) owns local circuits and transit hop state
and [`router`](./router/index.html) coordinates everything over a link
layer.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

pub mod dht;
pub mod link;
pub mod nodedb;
pub mod path;
pub mod profile;
pub mod router;
pub mod time;
