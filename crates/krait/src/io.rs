//! Output plumbing for the `print` statement.

use std::borrow::Cow;
use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

/// Trait for handling output from the script `print` statement.
///
/// Implement this to capture or redirect print output. The default
/// implementation [`StdPrint`] writes to the process stdout.
pub trait PrintWriter {
    /// Called once for each printed item, without separators.
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Adds a single character: the spaces between items and the final
    /// newline.
    fn stdout_push(&mut self, end: char);
}

/// Default writer targeting the process stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(output.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut out = std::io::stdout().lock();
        let mut buf = [0u8; 4];
        let _ = out.write_all(end.encode_utf8(&mut buf).as_bytes());
    }
}

/// Writer that collects everything into a shared string, for tests and
/// hosts that want the output back.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    buf: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared handle to the collected output; stays valid after the
    /// writer moves into the VM.
    #[must_use]
    pub fn handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.buf)
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.buf.borrow_mut().push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.buf.borrow_mut().push(end);
    }
}
