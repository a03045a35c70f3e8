//! Invocation-id allocation.
//!
//! Invocation ids must be unique across an entire agent process, including
//! every parser and sub-agent, so allocation goes through one process-wide
//! counter. The LLM may also supply its own id in a call header; those pass
//! through untouched.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// Allocate the next `gadget_<N>` invocation id.
pub fn next_invocation_id() -> String {
    let n = NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed);
    format!("gadget_{}", n)
}
