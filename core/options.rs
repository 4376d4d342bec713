// Copyright 2018-2025 the Deno authors. MIT license.
use crate::metrics::StreamMetricsFn;
use serde::Deserialize;
use std::fmt;
use std::num::NonZeroUsize;

pub const DEFAULT_BACKLOG: u32 = 128;
pub const DEFAULT_READ_BUFFER_SIZE: NonZeroUsize =
  NonZeroUsize::new(64 * 1024).unwrap();
pub const DEFAULT_MAX_READ_PASSES: NonZeroUsize =
  NonZeroUsize::new(16).unwrap();

/// Configuration for a [`crate::StreamLoop`].
///
/// Everything except `metrics` can also be read from JSON, with missing keys
/// taking their default value. Zero is rejected for the buffer size and the
/// pass count.
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopOptions {
  /// Backlog passed to the substrate when `listen` is called without one.
  pub default_backlog: u32,

  /// Size of the per-handle read buffer, allocated on the first
  /// `read_start`.
  pub read_buffer_size: NonZeroUsize,

  /// How many times a single tick polls the reading handles before yielding.
  pub max_read_passes: NonZeroUsize,

  /// Optional collector notified when stream operations are dispatched and
  /// completed.
  #[serde(skip)]
  pub metrics: Option<StreamMetricsFn>,
}

impl Default for LoopOptions {
  fn default() -> Self {
    Self {
      default_backlog: DEFAULT_BACKLOG,
      read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
      max_read_passes: DEFAULT_MAX_READ_PASSES,
      metrics: None,
    }
  }
}

impl LoopOptions {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

impl fmt::Debug for LoopOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoopOptions")
      .field("default_backlog", &self.default_backlog)
      .field("read_buffer_size", &self.read_buffer_size)
      .field("max_read_passes", &self.max_read_passes)
      .field("metrics", &self.metrics.is_some())
      .finish()
  }
}
