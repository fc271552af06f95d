//! Process exit codes for `meshsh connect`

use msh_core::error::ConnectionError;
use msh_protocol::RemoteStatus;

use crate::error::ClientError;
use crate::session::SessionEnd;

/// Local failure, including local interruption
pub const LOCAL_ERROR: u8 = 1;
/// No link could be established
pub const CONNECT_TIMEOUT: u8 = 250;
/// The listener did not start the program in time
pub const REQUEST_TIMEOUT: u8 = 251;
/// The listener refused the session
pub const AUTHENTICATION_FAILED: u8 = 252;
/// The link was lost while the program ran
pub const LINK_LOST: u8 = 253;
/// The remote program was killed by a signal (mirror mode)
pub const REMOTE_SIGNALED: u8 = 254;
/// The remote program could not be started
pub const REMOTE_START_FAILED: u8 = 255;

/// Exit code for a session that ran to an end
pub fn for_session(end: &SessionEnd, mirror: bool) -> u8 {
    match end {
        SessionEnd::Exited(status) => for_status(status, mirror),
        SessionEnd::Detached => LOCAL_ERROR,
    }
}

/// Exit code for a remote status
///
/// Start failures always report 255; otherwise the remote result is only
/// mirrored when asked for.
pub fn for_status(status: &RemoteStatus, mirror: bool) -> u8 {
    match status {
        RemoteStatus::SpawnFailed(_) | RemoteStatus::PtyAllocationFailed(_) => REMOTE_START_FAILED,
        _ if !mirror => 0,
        RemoteStatus::Exited(code) => (*code).clamp(0, 255) as u8,
        RemoteStatus::Signaled(_) => REMOTE_SIGNALED,
    }
}

/// Exit code for a session that failed
pub fn for_error(error: &ClientError) -> u8 {
    match error {
        ClientError::Connection(ConnectionError::ConnectTimeout(_)) => CONNECT_TIMEOUT,
        ClientError::Connection(ConnectionError::RequestTimeout(_)) => REQUEST_TIMEOUT,
        ClientError::Connection(ConnectionError::AuthenticationFailed(_)) => AUTHENTICATION_FAILED,
        ClientError::Connection(ConnectionError::LinkLost(_)) => LINK_LOST,
        ClientError::Link(_) => CONNECT_TIMEOUT,
        ClientError::Session(_) | ClientError::Terminal(_) => LOCAL_ERROR,
    }
}
