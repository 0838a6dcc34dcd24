//! Progress reporting interface.
//!
//! The executor reports through this trait and never writes to stdout or
//! stderr itself. Implementations (the CLI's `basic`, `steps`, and
//! `progress` styles) serialize their own output; one notification call is
//! atomic from the executor's point of view.

/// How a node ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
  /// The recipe ran to completion.
  Built,
  /// Nothing to do.
  UpToDate,
  /// Not run because a prerequisite failed or the build was cancelled.
  Skipped,
  /// The recipe failed.
  Failed,
}

/// Which stream a piece of recipe output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
  Stdout,
  Stderr,
}

pub trait Printer: Send + Sync {
  /// A node's recipe is about to run.
  fn start(&self, name: &str);

  /// A node finished with the given status.
  fn finish(&self, name: &str, status: BuildStatus);

  /// Output captured from a node's recipe. Bytes within one recipe arrive
  /// in order; different recipes may interleave.
  fn output(&self, name: &str, stream: OutputStream, bytes: &[u8]);

  /// A free-form informational message (echoed commands, clean results).
  fn info(&self, msg: &str);
}

/// Discards everything.
pub struct NullPrinter;

impl Printer for NullPrinter {
  fn start(&self, _name: &str) {}
  fn finish(&self, _name: &str, _status: BuildStatus) {}
  fn output(&self, _name: &str, _stream: OutputStream, _bytes: &[u8]) {}
  fn info(&self, _msg: &str) {}
}
