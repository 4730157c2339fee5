//! Waiter notification abstraction.
//!
//! A `Notifier` wakes a caller blocked in `wait_for_completions` when the
//! backend posts new completions.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default): writes 1 to an eventfd. The waiter polls
//!   the eventfd with a timeout. An external event loop can poll the same
//!   fd and harvest with a zero timeout.

use std::time::Duration;

use crate::error::Result;

/// Wakes the completion consumer.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the consumer wakes are coalesced
///   (eventfd semantics: counter increments, one read drains).
pub trait Notifier: Send + Sync {
    /// Signal that new completions are available.
    fn notify(&self) -> Result<()>;

    /// Block until signalled or until `timeout` elapses (`None` = forever).
    ///
    /// Returns `true` if a signal was consumed.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;
}
