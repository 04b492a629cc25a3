use std::{collections::HashMap, env::VarError};

use crate::ConfigureError;

/// Internal helper to get the `key` from the environment.
///
/// If `env` is provided, will use that instead of the process environment. Empty values are
/// treated as unset.
pub fn get_optional_env(
    key: &str,
    env: Option<&HashMap<String, String>>,
) -> Result<Option<String>, ConfigureError> {
    let value = if let Some(env) = env {
        env.get(key).cloned()
    } else {
        match std::env::var(key) {
            Ok(value) => Some(value),
            Err(VarError::NotPresent) => None,
            Err(VarError::NotUnicode(_)) => {
                return Err(ConfigureError::Other(
                    format!("{key} is not valid UTF-8").into(),
                ));
            }
        }
    };
    Ok(value.filter(|v| !v.is_empty()))
}
