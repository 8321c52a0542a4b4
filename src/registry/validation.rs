//! Input validation for server configurations.
//!
//! Enforced at the admin edge on every write and re-checked by the
//! supervisor before spawn.

use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::warn;

/// Commands a server configuration may launch.
pub const ALLOWED_COMMANDS: &[&str] = &["npx", "node", "python", "python3", "uvx", "docker"];

pub const MAX_SERVER_ID_LEN: usize = 64;
pub const MAX_ENV_VALUE_LEN: usize = 10_000;

/// Ids that would shadow the gateway's own routes.
const RESERVED_IDS: &[&str] = &["api", "health"];

/// Server ids are lowercase alphanumeric plus `-`, starting with an
/// alphanumeric, and are immutable after create.
pub fn validate_server_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SERVER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !id.starts_with('-');
    if !valid {
        return Err(Error::BadInput(format!(
            "invalid server id {id:?}: expected lowercase alphanumeric plus '-'"
        )));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(Error::BadInput(format!("server id {id:?} is reserved")));
    }
    Ok(())
}

pub fn validate_command(command: &str) -> Result<()> {
    if !ALLOWED_COMMANDS.contains(&command) {
        return Err(Error::CommandDenied(command.to_string()));
    }
    // Resolution failures are the spawn path's problem; flag them early but
    // do not reject the configuration.
    if which::which(command).is_err() {
        warn!("command {command:?} is allowed but not resolvable on PATH");
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(Error::BadInput(format!(
            "invalid environment variable name {name:?}"
        )))
    }
}

pub fn validate_env_value(name: &str, value: &str) -> Result<()> {
    if value.len() > MAX_ENV_VALUE_LEN {
        return Err(Error::BadInput(format!(
            "value for {name} exceeds {MAX_ENV_VALUE_LEN} characters"
        )));
    }
    if value.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(Error::BadInput(format!(
            "value for {name} contains control characters"
        )));
    }
    Ok(())
}

pub fn validate_env(env: &HashMap<String, String>) -> Result<()> {
    for (name, value) in env {
        validate_env_name(name)?;
        validate_env_value(name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_shape() {
        assert!(validate_server_id("fs").is_ok());
        assert!(validate_server_id("my-server-2").is_ok());
        assert!(validate_server_id("").is_err());
        assert!(validate_server_id("-leading").is_err());
        assert!(validate_server_id("CAPS").is_err());
        assert!(validate_server_id("under_score").is_err());
        assert!(validate_server_id(&"a".repeat(65)).is_err());
        assert!(validate_server_id("api").is_err());
        assert!(validate_server_id("health").is_err());
    }

    #[test]
    fn command_allow_list() {
        assert!(validate_command("npx").is_ok());
        assert!(validate_command("python3").is_ok());
        let err = validate_command("bash").unwrap_err();
        assert_eq!(err.kind(), "command-denied");
        let err = validate_command("/usr/bin/python3").unwrap_err();
        assert_eq!(err.kind(), "command-denied");
    }

    #[test]
    fn env_name_shape() {
        assert!(validate_env_name("LOG_LEVEL").is_ok());
        assert!(validate_env_name("_PRIVATE").is_ok());
        assert!(validate_env_name("A1").is_ok());
        assert!(validate_env_name("1A").is_err());
        assert!(validate_env_name("lower").is_err());
        assert!(validate_env_name("WITH-DASH").is_err());
        assert!(validate_env_name("").is_err());
    }

    #[test]
    fn env_value_limits() {
        assert!(validate_env_value("K", "debug").is_ok());
        assert!(validate_env_value("K", &"x".repeat(10_001)).is_err());
        assert!(validate_env_value("K", "has\0nul").is_err());
        assert!(validate_env_value("K", "has\nnewline").is_err());
    }
}
