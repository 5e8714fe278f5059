//! Fall back to environment variables for unset CLI args.
//!
//! ```ignore
//! args.relay_url.or_env_mut("NWC_RELAY_URL")?;
//! ```
//!
//! Values are parsed with [`FromStr`], so a malformed env value is reported
//! at startup instead of being silently ignored.

use std::{env, str::FromStr};

use anyhow::{Context, anyhow};

pub trait OrEnvExt: Sized {
    /// Like [`OrEnvExt::or_env_mut`], but by value, for `Option` chains.
    fn or_env(mut self, env_var: &'static str) -> anyhow::Result<Self> {
        self.or_env_mut(env_var)?;
        Ok(self)
    }

    /// Fill in the arg from `$env_var` if the arg wasn't given. An unset env
    /// var leaves the arg as is.
    fn or_env_mut(
        &mut self,
        env_var: &'static str,
    ) -> anyhow::Result<&mut Self>;
}

/// `$env_var`, or [`None`] if unset or empty.
fn read_env(env_var: &'static str) -> anyhow::Result<Option<String>> {
    match env::var(env_var) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) =>
            Err(anyhow!("`${env_var}` is not valid unicode")),
    }
}

impl<T> OrEnvExt for Option<T>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    fn or_env_mut(
        &mut self,
        env_var: &'static str,
    ) -> anyhow::Result<&mut Self> {
        if self.is_some() {
            return Ok(self);
        }
        if let Some(value) = read_env(env_var)? {
            let value = T::from_str(value.trim())
                .map_err(Into::into)
                .with_context(|| format!("Invalid value for `${env_var}`"))?;
            *self = Some(value);
        }
        Ok(self)
    }
}

/// Switches: a flag given on the command line wins, otherwise the env var
/// may turn it on.
impl OrEnvExt for bool {
    fn or_env_mut(
        &mut self,
        env_var: &'static str,
    ) -> anyhow::Result<&mut Self> {
        if *self {
            return Ok(self);
        }
        if let Some(value) = read_env(env_var)? {
            *self = bool::from_str(value.trim())
                .with_context(|| format!("Invalid value for `${env_var}`"))?;
        }
        Ok(self)
    }
}
