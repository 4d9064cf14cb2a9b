//! Unsubscribe handles returned by the bus and the store.

use std::fmt;

use crate::types::{ListenerId, Result};

type Detach = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Handle that removes one subscription when consumed.
///
/// Dropping the handle does NOT unsubscribe; the subscription lives until
/// [`Unsubscribe::unsubscribe`] is called or its owner is dropped. Once
/// `unsubscribe` returns, the listener is never invoked again.
pub struct Unsubscribe {
    id: ListenerId,
    target: String,
    detach: Detach,
}

impl Unsubscribe {
    pub(crate) fn new(
        id: ListenerId,
        target: impl Into<String>,
        detach: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            detach: Box::new(detach),
        }
    }

    /// Id of the effective subscription this handle removes.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Topic or state path the subscription is bound to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Remove the subscription. Fails only if the owning bus or store has
    /// already been dropped.
    pub fn unsubscribe(self) -> Result<()> {
        (self.detach)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}
