//! Command validation stage.

use crate::error::ValidationError;

/// A request to change an entity.
///
/// Every command passes through [`Command::validate`] before it is issued
/// to the write store.
pub trait Command: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Checks the command, returning the first violation found.
    fn validate(&self) -> Result<(), ValidationError>;
}
