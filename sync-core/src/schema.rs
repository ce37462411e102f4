//! Schema migration planning.

use sync_types::SchemaVersion;
use thiserror::Error;

/// Why no migration plan exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaPlanError {
    /// The local cache claims a newer schema than the remote store.
    #[error("local schema v{local} is ahead of remote v{remote}")]
    LocalAhead {
        /// Local version.
        local: u32,
        /// Remote version.
        remote: u32,
    },
    /// No migration is registered for this target version.
    #[error("no migration registered for schema v{0}")]
    Missing(u32),
}

/// Schema version of a freshly created local store layout.
///
/// A store with no recorded version reaches it without a registered
/// migration; a registered one still runs.
pub const BASELINE_VERSION: u32 = 1;

/// Target versions to apply, in order, to bring `local` up to `remote`.
///
/// `available` lists the target versions this build can migrate to. Every
/// step between the two versions must be available, except the baseline.
pub fn plan_migrations(
    version: SchemaVersion,
    available: &[u32],
) -> Result<Vec<u32>, SchemaPlanError> {
    if version.local > version.remote {
        return Err(SchemaPlanError::LocalAhead {
            local: version.local,
            remote: version.remote,
        });
    }
    ((version.local + 1)..=version.remote)
        .filter_map(|target| {
            if available.contains(&target) {
                Some(Ok(target))
            } else if target == BASELINE_VERSION {
                None
            } else {
                Some(Err(SchemaPlanError::Missing(target)))
            }
        })
        .collect()
}
