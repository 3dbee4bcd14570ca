//! Backend selection.
//!
//! Strict ordinal preference with failover: the first usable backend in
//! configured order wins. Every selection rescans the whole set, so a
//! recovered primary is used again immediately and a dead one stops
//! receiving traffic immediately.

use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::Backend;

/// Select the first usable backend.
///
/// A backend that is still flagged available but whose link is missing or
/// closed is demoted during the scan.
pub fn select(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    for backend in backends {
        if backend.is_usable() {
            return Some(Arc::clone(backend));
        }

        if !backend.link_is_open() && backend.demote_if_available() {
            debug!(backend = %backend.name(), "Discovered dead link during selection");
        }
    }

    warn!(backend_count = backends.len(), "No usable backends");
    None
}
