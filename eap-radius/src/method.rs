//! The interface every EAP method implements.

use std::sync::Arc;

use eap_radius_protocol::Method;
use thiserror::Error;

use crate::config::ConfigSection;
use crate::radius::Request;
use crate::session::EapSession;

/// A method callback reported failure; the dispatcher turns this into an
/// EAP-Failure towards the peer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(String);

impl MethodError {
    /// Wraps a failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Which of a method's two entry points the next round should invoke.
///
/// A fresh session starts at [`SessionInit`](CallbackSlot::SessionInit);
/// the method flips the slot to [`Process`](CallbackSlot::Process) once its
/// first request to the peer is composed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackSlot {
    /// Invoke [`EapMethod::session_init`].
    SessionInit,

    /// Invoke [`EapMethod::process`].
    Process,
}

/// A pluggable EAP method.
///
/// Methods own their per-session state through
/// [`EapSession::opaque`](crate::session::EapSession): they install it in
/// `session_init`, downcast it in `process`, and it is dropped when the
/// session is destroyed or the peer NAKs to another method.
pub trait EapMethod: Send + Sync {
    /// The submodule name, used as the request's log tag while the method
    /// runs (e.g. `"eap_md5"`).
    fn name(&self) -> &'static str;

    /// Begins a conversation: composes the method's first request to the
    /// peer into the session's current round.
    fn session_init(
        &self,
        request: &mut Request,
        session: &mut EapSession,
    ) -> Result<(), MethodError>;

    /// Processes one peer response, composing the next packet to send.
    fn process(&self, request: &mut Request, session: &mut EapSession) -> Result<(), MethodError>;
}

/// A configured, instantiated method held by the registry.
///
/// Handles are reference-counted; a session pins the handle of its running
/// method, so registry teardown cannot outrun live sessions whose opaque
/// state is destroyed by the method's code.
pub struct MethodHandle {
    method: Method,
    submodule: Arc<dyn EapMethod>,
    cs: ConfigSection,
}

impl MethodHandle {
    /// Bundles an instantiated submodule with its method number and
    /// configuration section.
    pub fn new(method: Method, submodule: Arc<dyn EapMethod>, cs: ConfigSection) -> Self {
        Self {
            method,
            submodule,
            cs,
        }
    }

    /// The EAP method number this handle serves.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The submodule name.
    pub fn name(&self) -> &'static str {
        self.submodule.name()
    }

    /// The instantiated submodule.
    pub fn submodule(&self) -> &dyn EapMethod {
        self.submodule.as_ref()
    }

    /// The configuration section the method was instantiated from.
    pub fn config(&self) -> &ConfigSection {
        &self.cs
    }
}

impl std::fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandle")
            .field("method", &self.method)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
