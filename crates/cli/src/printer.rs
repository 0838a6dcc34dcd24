//! Printer styles.
//!
//! Three implementations of the engine's `Printer` interface: `basic`
//! echoes commands and output as they happen, `steps` prefixes a
//! `[k/n]` counter, and `progress` rewrites a single status line. Each
//! holds one mutex so a notification prints atomically.

use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use owo_colors::{OwoColorize, Stream};

use knit_engine::printer::{BuildStatus, OutputStream, Printer};

fn write_output(stream: OutputStream, bytes: &[u8]) {
  match stream {
    OutputStream::Stdout => {
      let stdout = io::stdout();
      let mut out = stdout.lock();
      let _ = out.write_all(bytes);
    }
    OutputStream::Stderr => {
      let stderr = io::stderr();
      let mut err = stderr.lock();
      let _ = err.write_all(bytes);
    }
  }
}

/// Echoes commands and recipe output, nothing more.
pub struct BasicPrinter {
  lock: Mutex<()>,
}

impl BasicPrinter {
  pub fn new() -> BasicPrinter {
    BasicPrinter { lock: Mutex::new(()) }
  }
}

impl Printer for BasicPrinter {
  fn start(&self, _name: &str) {}

  fn finish(&self, name: &str, status: BuildStatus) {
    if status == BuildStatus::Failed {
      let _guard = self.lock.lock().unwrap();
      eprintln!(
        "{} {}",
        "failed:".if_supports_color(Stream::Stderr, |s| s.red()),
        name
      );
    }
  }

  fn output(&self, _name: &str, stream: OutputStream, bytes: &[u8]) {
    let _guard = self.lock.lock().unwrap();
    write_output(stream, bytes);
  }

  fn info(&self, msg: &str) {
    let _guard = self.lock.lock().unwrap();
    println!("{}", msg);
  }
}

/// Prefixes each started node with a `[k/n]` counter.
pub struct StepsPrinter {
  total: usize,
  started: AtomicUsize,
  lock: Mutex<()>,
}

impl StepsPrinter {
  pub fn new(total: usize) -> StepsPrinter {
    StepsPrinter {
      total,
      started: AtomicUsize::new(0),
      lock: Mutex::new(()),
    }
  }
}

impl Printer for StepsPrinter {
  fn start(&self, name: &str) {
    let k = self.started.fetch_add(1, Ordering::SeqCst) + 1;
    let _guard = self.lock.lock().unwrap();
    println!(
      "{} {}",
      format!("[{}/{}]", k, self.total).if_supports_color(Stream::Stdout, |s| s.cyan()),
      name
    );
  }

  fn finish(&self, name: &str, status: BuildStatus) {
    if status == BuildStatus::Failed {
      let _guard = self.lock.lock().unwrap();
      eprintln!(
        "{} {}",
        "failed:".if_supports_color(Stream::Stderr, |s| s.red()),
        name
      );
    }
  }

  fn output(&self, _name: &str, stream: OutputStream, bytes: &[u8]) {
    let _guard = self.lock.lock().unwrap();
    write_output(stream, bytes);
  }

  fn info(&self, msg: &str) {
    let _guard = self.lock.lock().unwrap();
    println!("{}", msg);
  }
}

/// Rewrites one status line as nodes start and finish.
pub struct ProgressPrinter {
  total: usize,
  done: AtomicUsize,
  state: Mutex<ProgressState>,
}

struct ProgressState {
  current: String,
}

impl ProgressPrinter {
  pub fn new(total: usize) -> ProgressPrinter {
    ProgressPrinter {
      total,
      done: AtomicUsize::new(0),
      state: Mutex::new(ProgressState {
        current: String::new(),
      }),
    }
  }

  fn redraw(&self, state: &ProgressState) {
    let done = self.done.load(Ordering::SeqCst);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = write!(out, "\r\x1b[2K[{}/{}] {}", done, self.total, state.current);
    let _ = out.flush();
  }

  fn clear_line(&self) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = write!(out, "\r\x1b[2K");
    let _ = out.flush();
  }
}

impl Printer for ProgressPrinter {
  fn start(&self, name: &str) {
    let mut state = self.state.lock().unwrap();
    state.current = name.to_string();
    self.redraw(&state);
  }

  fn finish(&self, name: &str, status: BuildStatus) {
    let mut state = self.state.lock().unwrap();
    match status {
      BuildStatus::Built => {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.redraw(&state);
      }
      BuildStatus::Failed => {
        self.clear_line();
        eprintln!(
          "{} {}",
          "failed:".if_supports_color(Stream::Stderr, |s| s.red()),
          name
        );
        self.redraw(&state);
      }
      BuildStatus::UpToDate | BuildStatus::Skipped => {}
    }
    if self.done.load(Ordering::SeqCst) >= self.total {
      state.current.clear();
      self.clear_line();
    }
  }

  fn output(&self, _name: &str, stream: OutputStream, bytes: &[u8]) {
    let state = self.state.lock().unwrap();
    self.clear_line();
    write_output(stream, bytes);
    self.redraw(&state);
  }

  fn info(&self, msg: &str) {
    let state = self.state.lock().unwrap();
    self.clear_line();
    {
      let stdout = io::stdout();
      let mut out = stdout.lock();
      let _ = writeln!(out, "{}", msg);
    }
    self.redraw(&state);
  }
}
