/*!
Link-layer boundary.

How bytes reach another router is not this crate's business; the
[`LinkLayer`](./trait.LinkLayer.html) trait is the whole contract. A link
implementation delivers inbound frames and session lifecycle changes as
[`LinkEvent`](./enum.LinkEvent.html)s into the router's event channel.

[`memory`](./memory/index.html) provides a loss-free in-process
implementation used by the test suites.
*/

pub mod memory;

use futures::channel::mpsc;

use nyx_crypto::RouterId;
use nyx_packet::router_contact::RouterContact;

/// What a link implementation reports back to the router.
#[derive(Debug)]
pub enum LinkEvent {
    /// A session to the peer owning this descriptor is up.
    SessionEstablished(RouterContact),
    /// The session to this peer is gone.
    SessionClosed(RouterId),
    /// An establish attempt gave up.
    ConnectTimeout(RouterId),
    /// One datagram arrived over an established session.
    Frame {
        /// Authenticated sender of the frame.
        from: RouterId,
        /// Raw frame bytes.
        bytes: Vec<u8>,
    },
}

/// Sender half of a router's link event channel.
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Receiver half of a router's link event channel.
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// The transport a router sends through. Implementations must be cheap to
/// call from the logic tasks; anything slow happens behind the trait.
pub trait LinkLayer: Send + Sync {
    /// Whether a session to the peer is currently open.
    fn has_session_to(&self, remote: &RouterId) -> bool;

    /// Start establishing a session; the outcome arrives as a
    /// `SessionEstablished` or `ConnectTimeout` event.
    fn try_establish_to(&self, rc: &RouterContact);

    /// Send one frame over an open session. `false` when there is no
    /// session or the send failed.
    fn send_to(&self, remote: &RouterId, frame: Vec<u8>) -> bool;

    /// Keep the session to the peer from idling out.
    fn keep_alive(&self, remote: &RouterId);

    /// Close every session.
    fn close_all(&self);

    /// Number of open sessions.
    fn session_count(&self) -> usize;

    /// Peers with open sessions.
    fn sessions(&self) -> Vec<RouterId>;
}
