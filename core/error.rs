// Copyright 2018-2025 the Deno authors. MIT license.

use crate::handle_table::HandleId;
use crate::stream::StreamState;
use std::borrow::Cow;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::ErrorKind;

/// A generic wrapper that can encapsulate any concrete error type. Listener
/// results use this so embedders can return whatever error they like.
pub type AnyError = anyhow::Error;

// libuv-compatible error codes (negative errno values on unix,
// which vary depending on platform, fixed values on windows).
macro_rules! uv_errno {
  ($name:ident, $unix:expr, $win:expr) => {
    #[cfg(unix)]
    pub const $name: i32 = -($unix);
    #[cfg(windows)]
    pub const $name: i32 = $win;
  };
}

uv_errno!(UV_EAGAIN, libc::EAGAIN, -4088);
uv_errno!(UV_EBADF, libc::EBADF, -4083);
uv_errno!(UV_EADDRINUSE, libc::EADDRINUSE, -4091);
uv_errno!(UV_EADDRNOTAVAIL, libc::EADDRNOTAVAIL, -4090);
uv_errno!(UV_ECONNREFUSED, libc::ECONNREFUSED, -4078);
uv_errno!(UV_ECONNRESET, libc::ECONNRESET, -4077);
uv_errno!(UV_ECONNABORTED, libc::ECONNABORTED, -4079);
uv_errno!(UV_EINVAL, libc::EINVAL, -4071);
uv_errno!(UV_EIO, libc::EIO, -4070);
uv_errno!(UV_ENOTCONN, libc::ENOTCONN, -4053);
uv_errno!(UV_ENOTSUP, libc::ENOTSUP, -4049);
uv_errno!(UV_ECANCELED, libc::ECANCELED, -4081);
uv_errno!(UV_EPIPE, libc::EPIPE, -4047);
uv_errno!(UV_ETIMEDOUT, libc::ETIMEDOUT, -4039);
pub const UV_EOF: i32 = -4095;
pub const UV_UNKNOWN: i32 = -4094;

/// A status code reported by the I/O substrate, in libuv's negative errno
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UvError(i32);

impl UvError {
  pub const EAGAIN: UvError = UvError(UV_EAGAIN);
  pub const EBADF: UvError = UvError(UV_EBADF);
  pub const EADDRINUSE: UvError = UvError(UV_EADDRINUSE);
  pub const EADDRNOTAVAIL: UvError = UvError(UV_EADDRNOTAVAIL);
  pub const ECONNREFUSED: UvError = UvError(UV_ECONNREFUSED);
  pub const ECONNRESET: UvError = UvError(UV_ECONNRESET);
  pub const ECONNABORTED: UvError = UvError(UV_ECONNABORTED);
  pub const EINVAL: UvError = UvError(UV_EINVAL);
  pub const EIO: UvError = UvError(UV_EIO);
  pub const ENOTCONN: UvError = UvError(UV_ENOTCONN);
  pub const ENOTSUP: UvError = UvError(UV_ENOTSUP);
  pub const ECANCELED: UvError = UvError(UV_ECANCELED);
  pub const EPIPE: UvError = UvError(UV_EPIPE);
  pub const ETIMEDOUT: UvError = UvError(UV_ETIMEDOUT);
  pub const EOF: UvError = UvError(UV_EOF);
  pub const UNKNOWN: UvError = UvError(UV_UNKNOWN);

  /// Wraps a raw status. Non-negative values are not errors in libuv, so they
  /// are folded into `UNKNOWN`.
  pub const fn from_code(code: i32) -> Self {
    if code < 0 { UvError(code) } else { UvError(UV_UNKNOWN) }
  }

  pub const fn code(self) -> i32 {
    self.0
  }

  /// The symbolic name, as `uv_err_name` would return it.
  pub fn name(self) -> &'static str {
    match self.0 {
      UV_EAGAIN => "EAGAIN",
      UV_EBADF => "EBADF",
      UV_EADDRINUSE => "EADDRINUSE",
      UV_EADDRNOTAVAIL => "EADDRNOTAVAIL",
      UV_ECONNREFUSED => "ECONNREFUSED",
      UV_ECONNRESET => "ECONNRESET",
      UV_ECONNABORTED => "ECONNABORTED",
      UV_EINVAL => "EINVAL",
      UV_EIO => "EIO",
      UV_ENOTCONN => "ENOTCONN",
      UV_ENOTSUP => "ENOTSUP",
      UV_ECANCELED => "ECANCELED",
      UV_EPIPE => "EPIPE",
      UV_ETIMEDOUT => "ETIMEDOUT",
      UV_EOF => "EOF",
      _ => "UNKNOWN",
    }
  }

  /// The human readable message, as `uv_strerror` would return it.
  pub fn message(self) -> &'static str {
    match self.0 {
      UV_EAGAIN => "resource temporarily unavailable",
      UV_EBADF => "bad file descriptor",
      UV_EADDRINUSE => "address already in use",
      UV_EADDRNOTAVAIL => "address not available",
      UV_ECONNREFUSED => "connection refused",
      UV_ECONNRESET => "connection reset by peer",
      UV_ECONNABORTED => "software caused connection abort",
      UV_EINVAL => "invalid argument",
      UV_EIO => "i/o error",
      UV_ENOTCONN => "socket is not connected",
      UV_ENOTSUP => "operation not supported on socket",
      UV_ECANCELED => "operation canceled",
      UV_EPIPE => "broken pipe",
      UV_ETIMEDOUT => "connection timed out",
      UV_EOF => "end of file",
      _ => "unknown error",
    }
  }
}

impl Display for UvError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name(), self.message())
  }
}

impl std::error::Error for UvError {}

impl From<std::io::Error> for UvError {
  fn from(err: std::io::Error) -> Self {
    #[cfg(unix)]
    {
      if let Some(errno) = err.raw_os_error() {
        return UvError(-errno);
      }
    }
    match err.kind() {
      ErrorKind::WouldBlock => UvError::EAGAIN,
      ErrorKind::AddrInUse => UvError::EADDRINUSE,
      ErrorKind::AddrNotAvailable => UvError::EADDRNOTAVAIL,
      ErrorKind::ConnectionRefused => UvError::ECONNREFUSED,
      ErrorKind::ConnectionReset => UvError::ECONNRESET,
      ErrorKind::ConnectionAborted => UvError::ECONNABORTED,
      ErrorKind::NotConnected => UvError::ENOTCONN,
      ErrorKind::BrokenPipe => UvError::EPIPE,
      ErrorKind::InvalidInput => UvError::EINVAL,
      ErrorKind::TimedOut => UvError::ETIMEDOUT,
      ErrorKind::Unsupported => UvError::ENOTSUP,
      ErrorKind::UnexpectedEof => UvError::EOF,
      _ => UvError::EIO,
    }
  }
}

/// The translated form of a failure reported by the substrate at completion
/// time. It is delivered through the "error" event or a completion callback,
/// never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncError {
  err: UvError,
  op: &'static str,
}

impl AsyncError {
  pub const fn new(err: UvError, op: &'static str) -> Self {
    Self { err, op }
  }

  pub const fn code(&self) -> i32 {
    self.err.code()
  }

  pub fn name(&self) -> &'static str {
    self.err.name()
  }

  pub fn message(&self) -> &'static str {
    self.err.message()
  }

  /// The completion handler that produced this error, e.g. `"after_write"`.
  pub const fn op(&self) -> &'static str {
    self.op
  }

  pub const fn uv_error(&self) -> UvError {
    self.err
  }
}

impl Display for AsyncError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}, {} ({})", self.name(), self.message(), self.op)
  }
}

impl std::error::Error for AsyncError {}

/// Synchronous misuse of a stream operation. The call is aborted and the
/// handle is left as it was.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
  #[error("Bad handle ID {0}")]
  BadHandle(HandleId),
  #[error("{op}: handle is {state}")]
  InvalidState {
    op: &'static str,
    state: StreamState,
  },
  #[error("read_start: stream is already reading")]
  AlreadyReading,
  #[error("read_stop: stream is not reading")]
  NotReading,
  #[error("{op}: stream is not writable ({state})")]
  NotWritable {
    op: &'static str,
    state: StreamState,
  },
  #[error("Handle {0} is closing")]
  Closing(HandleId),
  #[error(
    "Accidentally wrote incoming data into a readonly buffer. Did you re-enter the event loop from inside a data event listener?"
  )]
  BufferExposed,
  #[error("listen: {0}")]
  Listen(#[source] UvError),
  #[error("accept: {0}")]
  Accept(#[source] UvError),
  #[error("bind: {0}")]
  Bind(#[source] UvError),
  #[error("{op}: {err}")]
  Substrate {
    op: &'static str,
    #[source]
    err: UvError,
  },
  #[error(transparent)]
  Listener(#[from] AnyError),
}

impl StreamError {
  /// The error class an embedding runtime should surface this error as.
  pub fn get_class(&self) -> Cow<'static, str> {
    match self {
      StreamError::BadHandle(_) => Cow::Borrowed("BadResource"),
      StreamError::BufferExposed => Cow::Borrowed("Busy"),
      StreamError::InvalidState { .. }
      | StreamError::AlreadyReading
      | StreamError::NotReading
      | StreamError::NotWritable { .. }
      | StreamError::Closing(_) => Cow::Borrowed("TypeError"),
      StreamError::Listen(err)
      | StreamError::Accept(err)
      | StreamError::Bind(err)
      | StreamError::Substrate { err, .. } => Cow::Borrowed(uv_error_class(*err)),
      StreamError::Listener(_) => Cow::Borrowed("Error"),
    }
  }
}

fn uv_error_class(err: UvError) -> &'static str {
  match err.code() {
    UV_EADDRINUSE => "AddrInUse",
    UV_EADDRNOTAVAIL => "AddrNotAvailable",
    UV_ECONNREFUSED => "ConnectionRefused",
    UV_ECONNRESET => "ConnectionReset",
    UV_ECONNABORTED => "ConnectionAborted",
    UV_ENOTCONN => "NotConnected",
    UV_EPIPE => "BrokenPipe",
    UV_EAGAIN => "WouldBlock",
    UV_ETIMEDOUT => "TimedOut",
    UV_EINVAL => "InvalidData",
    UV_ENOTSUP => "NotSupported",
    UV_ECANCELED => "Interrupted",
    UV_EOF => "UnexpectedEof",
    _ => "Error",
  }
}
