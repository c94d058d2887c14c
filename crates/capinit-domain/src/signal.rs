use nix::sys::signal::Signal;

use crate::error::DomainError;

/// Parse a signal name from a declaration file.
///
/// Only the signals components actually coordinate with are accepted: the
/// reload, user-1, user-2, and terminate signals. The `SIG` prefix is
/// optional and matching is case-insensitive.
pub fn parse_signal(s: &str) -> Result<Signal, DomainError> {
    let name = s.trim().to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "HUP" => Ok(Signal::SIGHUP),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "TERM" => Ok(Signal::SIGTERM),
        _ => Err(DomainError::UnknownSignal(s.to_string())),
    }
}
