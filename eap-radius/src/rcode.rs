//! Module return codes shared with the RADIUS host's policy engine.

use core::fmt;

/// What a hook tells the server's policy engine about a request.
///
/// These mirror the host's module return codes; the dispatcher never invents
/// other values, so the engine can treat the EAP module like any other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rcode {
    /// The module succeeded.
    Ok,

    /// The module succeeded and modified the request.
    Updated,

    /// The module has fully handled the request; a reply is staged and the
    /// rest of the section should be skipped.
    Handled,

    /// The request is none of this module's business.
    Noop,

    /// The user should be denied access.
    Reject,

    /// The module failed in a way that is not the user's fault.
    Fail,

    /// The request was malformed or violated policy.
    Invalid,
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Ok => "ok",
                Self::Updated => "updated",
                Self::Handled => "handled",
                Self::Noop => "noop",
                Self::Reject => "reject",
                Self::Fail => "fail",
                Self::Invalid => "invalid",
            }
        )
    }
}
