/*! Errors enum for the router.
*/

use thiserror::Error;

/// Error that can happen when building a path.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BuildPathError {
    /// No hops were selected.
    #[error("no hops to build through")]
    NoHops,
    /// The key generation worker died.
    #[error("key generation worker failed")]
    Worker,
    /// The LR Commit could not be handed to the link layer.
    #[error("failed to send LR commit")]
    Send,
}
