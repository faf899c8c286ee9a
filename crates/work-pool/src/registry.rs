//! Process-wide pool registry.
//!
//! Pools register under a unique name so telemetry exporters can enumerate
//! them. The registry keeps weak handles only: it never extends a pool's
//! lifetime, and dead entries are pruned as they are encountered.
//!
//! Base names must not contain whitespace, hyphens, or digits; those are
//! reserved for the `-1`, `-2`, … suffixes appended on collision. An empty
//! base name skips registration entirely, which suits pools that are
//! created and torn down quickly.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::{Pool, PoolError};

static REGISTRY: LazyLock<Mutex<HashMap<String, Weak<dyn Pool>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns an error if the base name contains characters reserved for
/// collision suffixes.
pub(crate) fn validate_base_name(name: &str) -> Result<(), PoolError> {
    if name
        .chars()
        .any(|c| c.is_whitespace() || c == '-' || c.is_ascii_digit())
    {
        return Err(PoolError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Claims a unique registry slot derived from `base`, trying `base`,
/// `base-1`, `base-2`, … until a free slot is found. Returns `None` for an
/// empty base name (the pool stays unregistered).
pub(crate) fn claim(base: &str) -> Option<String> {
    if base.is_empty() {
        return None;
    }
    let mut registry = REGISTRY.lock();
    let mut n = 0usize;
    loop {
        let candidate = if n == 0 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        };
        // A dead weak handle means the previous owner is gone; reuse the
        // slot rather than growing the suffix forever.
        let taken = registry
            .get(&candidate)
            .is_some_and(|w| w.strong_count() > 0);
        if !taken {
            registry.insert(candidate.clone(), Weak::<placeholder::Null>::new());
            return Some(candidate);
        }
        n += 1;
    }
}

/// Points a claimed slot at the live pool handle.
pub(crate) fn attach(name: &str, handle: Weak<dyn Pool>) {
    REGISTRY.lock().insert(name.to_string(), handle);
}

/// Frees a claimed slot.
pub(crate) fn release(name: &str) {
    if !name.is_empty() {
        REGISTRY.lock().remove(name);
    }
}

/// Enumerates the currently live registered pools. Order is
/// non-deterministic. Dead entries encountered during the sweep are
/// removed.
pub fn pools() -> impl Iterator<Item = Arc<dyn Pool>> {
    let mut registry = REGISTRY.lock();
    let mut live = Vec::with_capacity(registry.len());
    registry.retain(|_, weak| match weak.upgrade() {
        Some(pool) => {
            live.push(pool);
            true
        }
        None => false,
    });
    live.into_iter()
}

/// Placeholder type for freshly claimed slots; never instantiated.
mod placeholder {
    use super::*;
    use crate::{Job, SubmitOptions};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    pub(super) struct Null;

    #[async_trait]
    impl Pool for Null {
        async fn submit_with(
            &self,
            _ctx: CancellationToken,
            _job: Job,
            _opts: SubmitOptions,
        ) -> Result<(), PoolError> {
            unreachable!("placeholder pool is never constructed")
        }

        async fn wait(&self) {}

        async fn close(&self) {}

        fn len(&self) -> usize {
            0
        }

        fn running(&self) -> usize {
            0
        }

        fn name(&self) -> &str {
            ""
        }
    }
}
