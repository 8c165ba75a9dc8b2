pub mod doctor;
pub mod pull;
pub mod run;

use brig_core::CoreError;
use brig_schema::{EnvVar, ProviderConfig};
use std::path::Path;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CANCELLED: u8 = 130;

pub fn load_config(path: Option<&Path>) -> Result<ProviderConfig, CoreError> {
    let config = match path {
        Some(path) => ProviderConfig::load(path)?,
        None => ProviderConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Parse a `NAME=value` argument. The value may itself contain `=`.
pub fn parse_env(arg: &str) -> Result<EnvVar, CoreError> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(EnvVar::new(name, value)),
        _ => Err(CoreError::Config(format!(
            "invalid --env '{arg}': expected NAME=value"
        ))),
    }
}

/// Map a container exit code onto a process exit status.
pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_arguments_split_on_first_equals() {
        let var = parse_env("OPTS=a=b").unwrap();
        assert_eq!(var.name, "OPTS");
        assert_eq!(var.value, "a=b");
        assert_eq!(parse_env("EMPTY=").unwrap().value, "");
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn exit_codes_outside_u8_fail() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), EXIT_FAILURE);
        assert_eq!(exit_status(300), EXIT_FAILURE);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(load_config(None).is_ok());
    }
}
