// SPDX-License-Identifier: Apache-2.0

//! Process-fatal invariant checks.
//!
//! The execution core relies on invariants that are unsound to continue
//! past (e.g. a cumulative timer stopped twice, a worker count going
//! negative). Violations are logged and the process aborts; there is no
//! partial recovery model.

/// Logs the violated invariant and aborts the process.
pub fn invariant_failed(message: &str) -> ! {
    tracing::error!(invariant = message, "invariant violated, aborting");
    std::process::abort();
}

/// Aborts the process when `condition` does not hold.
pub fn invariant(condition: bool, message: &str) {
    if !condition {
        invariant_failed(message);
    }
}
