//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn, warn_span};

use crate::maps::MapName;

/// Coordinator error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// One of the kernel maps could not be opened; the coordinator has
    /// entered degraded mode and every mutating map call is a no-op.
    MapUnavailable(MapName),
    /// A transient kernel error occurred while inserting/updating/deleting
    /// a map entry. In-memory state is left untouched so a later event can
    /// retry the same write.
    MapOperationFailed(MapName, MapOp, String),
    /// Internal inconsistency detected while processing an event. The
    /// affected downstream's rules are cleared as a best-effort repair.
    InvariantViolation(String),
    /// I/O error on the netlink transport that feeds neighbor/conntrack
    /// events or carries timeout-refresh messages.
    Netlink(std::io::Error),
}

/// The map operation that failed, used for the error-counter map key and
/// for log messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapOp {
    Insert,
    Update,
    Delete,
}

// ===== impl Error =====

impl Error {
    // Logs the error using the tracing API and, for map-operation failures,
    // returns the reason code that the caller should bump in the
    // error-counter map.
    pub(crate) fn log(&self) {
        match self {
            Error::MapUnavailable(map) => {
                error!(%map, "kernel map unavailable, entering degraded mode");
            }
            Error::MapOperationFailed(map, op, reason) => {
                warn_span!("maps").in_scope(|| {
                    warn!(%map, ?op, %reason, "{}", self);
                });
            }
            Error::InvariantViolation(detail) => {
                error!(%detail, "{}", self);
            }
            Error::Netlink(io_error) => {
                error!(%io_error, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MapUnavailable(map) => {
                write!(f, "kernel map '{map}' is unavailable")
            }
            Error::MapOperationFailed(map, op, _) => {
                write!(f, "map operation {op:?} failed on '{map}'")
            }
            Error::InvariantViolation(detail) => {
                write!(f, "internal invariant violated: {detail}")
            }
            Error::Netlink(error) => {
                write!(f, "netlink transport error: {error}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Netlink(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Error {
        Error::Netlink(error)
    }
}
