use std::path::PathBuf;

use nix::unistd::{User, geteuid};
use tracing::{debug, warn};

use crate::errors::MuxError;

/// Environment variables consulted for the login name, in order.
const LOGIN_NAME_VARS: [&str; 4] = ["LOGNAME", "USER", "LNAME", "USERNAME"];

/// Login shell of the current user, from the system account database.
///
/// The user is resolved by name first (login-name environment variables,
/// then the effective uid's account), and the account entry for that name is
/// looked up. Not cached; wrap in an [`ExpiringCache`](crate::cache::ExpiringCache)
/// when repeated lookups matter.
pub fn default_shell() -> Result<PathBuf, MuxError> {
    let user = current_username(|var| std::env::var(var).ok())?;
    shell_for_user(&user)
}

/// Login shell registered for `name`.
pub fn shell_for_user(name: &str) -> Result<PathBuf, MuxError> {
    match User::from_name(name) {
        Ok(Some(user)) => {
            debug!(
                event = "core.shell.resolve_completed",
                user = name,
                shell = %user.shell.display(),
            );
            Ok(user.shell)
        }
        Ok(None) => Err(MuxError::UserLookup {
            user: name.to_string(),
        }),
        Err(e) => {
            warn!(event = "core.shell.resolve_failed", user = name, error = %e);
            Err(MuxError::UserLookup {
                user: name.to_string(),
            })
        }
    }
}

/// Name of the invoking user.
///
/// `env` is queried for each login-name variable; the first non-empty value
/// wins. Falls back to the account entry of the effective uid.
pub fn current_username<F>(env: F) -> Result<String, MuxError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = LOGIN_NAME_VARS
        .iter()
        .filter_map(|var| env(var))
        .find(|value| !value.is_empty())
    {
        return Ok(name);
    }

    let uid = geteuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        _ => Err(MuxError::UserLookup {
            user: format!("uid {uid}"),
        }),
    }
}
