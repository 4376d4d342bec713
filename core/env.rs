// Copyright 2018-2025 the Deno authors. MIT license.

//! Process environment accessors.
//!
//! These act on the real process environment. Mutating it is only sound
//! while no other thread reads or writes the environment, which matches the
//! single threaded model of the rest of this crate.

use std::borrow::Cow;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvError {
  #[error("EINVAL: invalid environment variable name {0:?}")]
  InvalidName(String),
  #[error("EINVAL: value for {0:?} contains a NUL character")]
  InvalidValue(String),
  #[error("EINVAL: expected NAME=value, got {0:?}")]
  Malformed(String),
}

impl EnvError {
  pub fn get_class(&self) -> Cow<'static, str> {
    Cow::Borrowed("InvalidData")
  }
}

fn check_name(name: &str) -> Result<(), EnvError> {
  if name.is_empty() || name.contains(['=', '\0']) {
    return Err(EnvError::InvalidName(name.to_string()));
  }
  Ok(())
}

fn check_value(name: &str, value: &str) -> Result<(), EnvError> {
  if value.contains('\0') {
    return Err(EnvError::InvalidValue(name.to_string()));
  }
  Ok(())
}

/// Names of every variable in the environment, in environment order.
pub fn keys() -> Vec<String> {
  std::env::vars_os()
    .map(|(name, _)| name.to_string_lossy().into_owned())
    .collect()
}

/// Value of `name`, or `None` if it is unset or `name` is not a valid name.
pub fn get(name: &str) -> Option<String> {
  check_name(name).ok()?;
  std::env::var_os(name).map(|value| value.to_string_lossy().into_owned())
}

/// Sets `name` to `value`. When `overwrite` is false an existing value is
/// left alone.
pub fn set(name: &str, value: &str, overwrite: bool) -> Result<(), EnvError> {
  check_name(name)?;
  check_value(name, value)?;
  if !overwrite && std::env::var_os(name).is_some() {
    return Ok(());
  }
  // SAFETY: the environment is only touched from the loop thread.
  unsafe { std::env::set_var(name, value) };
  Ok(())
}

/// Sets a variable from a `NAME=value` string.
pub fn put(assignment: &str) -> Result<(), EnvError> {
  let Some((name, value)) = assignment.split_once('=') else {
    return Err(EnvError::Malformed(assignment.to_string()));
  };
  set(name, value, true)
}

pub fn unset(name: &str) -> Result<(), EnvError> {
  check_name(name)?;
  // SAFETY: the environment is only touched from the loop thread.
  unsafe { std::env::remove_var(name) };
  Ok(())
}
