//! SSH Message Dispatcher.
//!
//! Routes incoming payloads to the service that owns their message range.
//! Transport messages never get here; [`Transport`](super::transport::Transport)
//! consumes them.
//!
//! | Range   | Owner                                     |
//! |---------|-------------------------------------------|
//! | 5       | service request, answered by the session  |
//! | 50-79   | `ssh-userauth` until authentication ends  |
//! | 80-127  | `ssh-connection` once it was started      |
//! | other   | SSH_MSG_UNIMPLEMENTED                     |

use super::auth::{SERVICE_CONNECTION, SERVICE_USERAUTH};
use super::message::{MessageRange, MessageType};
use kestrel_platform::{KestrelError, KestrelResult};

/// Services a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// `ssh-userauth`
    UserAuth,
    /// `ssh-connection`
    Connection,
}

impl ServiceKind {
    /// Wire name of the service.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::UserAuth => SERVICE_USERAUTH,
            ServiceKind::Connection => SERVICE_CONNECTION,
        }
    }
}

/// Where one payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest,
    /// The running service
    Service(ServiceKind),
    /// Late authentication message, dropped silently
    Ignore,
    /// Reply with SSH_MSG_UNIMPLEMENTED
    Unimplemented,
}

/// Per-session routing state.
#[derive(Debug, Default)]
pub struct Dispatcher {
    userauth: bool,
    connection: bool,
    authenticated: bool,
}

impl Dispatcher {
    /// Creates a dispatcher with no service running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Records successful authentication and starts `ssh-connection`, the
    /// service named in the authentication request. The auth range is
    /// ignored from now on.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
        self.connection = true;
    }

    /// Routes a payload by its message id.
    pub fn route(&self, payload: &[u8]) -> Route {
        let id = match payload.first() {
            Some(id) => *id,
            None => return Route::Unimplemented,
        };
        if id == MessageType::ServiceRequest as u8 {
            return Route::ServiceRequest;
        }
        match MessageRange::of(id) {
            MessageRange::UserAuth if self.authenticated => Route::Ignore,
            MessageRange::UserAuth if self.userauth => Route::Service(ServiceKind::UserAuth),
            MessageRange::Connection
                if self.connection && MessageType::from_u8(id).is_some() =>
            {
                Route::Service(ServiceKind::Connection)
            }
            _ => Route::Unimplemented,
        }
    }

    /// Starts the named service.
    ///
    /// `ssh-userauth` may be requested once; `ssh-connection` only after
    /// authentication, where it is already running.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::ServiceNotAvailable`] otherwise.
    pub fn request_service(&mut self, name: &str) -> KestrelResult<ServiceKind> {
        match name {
            SERVICE_USERAUTH if !self.userauth && !self.authenticated => {
                self.userauth = true;
                Ok(ServiceKind::UserAuth)
            }
            SERVICE_CONNECTION if self.authenticated => {
                self.connection = true;
                Ok(ServiceKind::Connection)
            }
            other => Err(KestrelError::ServiceNotAvailable(other.to_string())),
        }
    }
}
