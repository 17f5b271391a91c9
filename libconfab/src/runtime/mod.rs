// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The seam between confab and the language runtime it serves.
//!
//! The server consumes the runtime through four narrow operations:
//! read one form, evaluate one form, print a value, and format a
//! failure trace. Everything the original system handled with dynamic
//! per-thread bindings travels in an explicit [`EvalContext`] instead,
//! which the driver builds from the session and the request.

use std::{fmt, sync::atomic::AtomicBool};

use confab_protocol::Value;

pub mod lisp;

/// Printer toggles carried by a session and installed into the
/// evaluation context for each request. The reference runtime honors
/// `pretty`, `print_length`, `print_level`, and `detail_on_error`;
/// the rest are carried for runtimes that give them meaning.
#[derive(Debug, Clone)]
pub struct PrinterPrefs {
    /// Use the pretty printer for result values when one is available.
    pub pretty: bool,
    /// Print at most this many items per collection.
    pub print_length: Option<i64>,
    /// Print collections at most this deep.
    pub print_level: Option<i64>,
    pub print_meta: bool,
    pub warn_on_reflection: bool,
    pub math_context: Option<String>,
    pub compile_path: Option<String>,
    pub command_line_args: Vec<String>,
    /// Write full cause traces to the err stream instead of the
    /// one-line form.
    pub detail_on_error: bool,
}

impl Default for PrinterPrefs {
    fn default() -> Self {
        PrinterPrefs {
            pretty: false,
            print_length: None,
            print_level: None,
            print_meta: false,
            warn_on_reflection: false,
            math_context: None,
            compile_path: None,
            command_line_args: vec![],
            detail_on_error: false,
        }
    }
}

/// An evaluation failure. `interrupted` failures abort the request
/// rather than recovering with the next form.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
    /// Underlying causes, outermost first.
    pub causes: Vec<String>,
    pub interrupted: bool,
}

impl EvalError {
    pub fn new<S: Into<String>>(message: S) -> EvalError {
        EvalError { message: message.into(), causes: vec![], interrupted: false }
    }

    pub fn with_cause<S: Into<String>, C: Into<String>>(message: S, cause: C) -> EvalError {
        EvalError { message: message.into(), causes: vec![cause.into()], interrupted: false }
    }

    pub fn interrupt() -> EvalError {
        EvalError {
            message: String::from("evaluation interrupted"),
            causes: vec![],
            interrupted: true,
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

/// The request's `in` text, exposed to evaluated code as its stdin so
/// reads never block on the network.
#[derive(Debug)]
pub struct StdinText {
    text: String,
    pos: usize,
}

impl StdinText {
    pub fn new<S: Into<String>>(text: S) -> StdinText {
        StdinText { text: text.into(), pos: 0 }
    }

    /// The next line without its terminator, or `None` at end of input.
    pub fn read_line(&mut self) -> Option<String> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];
        match rest.find('\n') {
            Some(idx) => {
                self.pos += idx + 1;
                Some(String::from(&rest[..idx]))
            }
            None => {
                self.pos = self.text.len();
                Some(String::from(rest))
            }
        }
    }
}

/// Where evaluated code's stdout and stderr go. The server backs this
/// with sinks that buffer and flush text back as framed response
/// chunks.
pub trait TextSink: Sync {
    fn append(&self, text: &str);
}

/// The server-side control surface that evaluated one-liners reach.
///
/// Interrupting a request, acknowledging a bound port, and retaining
/// or releasing the current session are all invoked by evaluating
/// code rather than by dedicated message kinds, so the runtime needs
/// a way back into the server hosting it.
pub trait ControlOps: Sync {
    /// Best-effort cancellation of the in-flight request with the
    /// given id. Returns whether the request was found.
    fn interrupt_eval(&self, id: &str) -> bool;

    /// Deliver a freshly bound server port to whoever is waiting on
    /// this server's port slot.
    fn deliver_server_port(&self, port: u16);

    /// Install the current session in the session store, returning its
    /// id. Retaining an already retained session returns the same id.
    fn retain_session(&self) -> String;

    /// Remove the current session from the session store. Returns
    /// whether it was previously retained.
    fn release_session(&self) -> bool;
}

/// Everything one request's evaluation runs under.
///
/// The driver seeds this from the session state, threads it through
/// each form, and writes `ns`, the value history, and the last
/// exception back to the session as it goes.
pub struct EvalContext<'a> {
    pub ns: String,
    pub v1: Option<Value>,
    pub v2: Option<Value>,
    pub v3: Option<Value>,
    pub last_exception: Option<EvalError>,
    pub printer: PrinterPrefs,
    pub stdin: StdinText,
    pub out: &'a dyn TextSink,
    pub err: &'a dyn TextSink,
    pub interrupt: &'a AtomicBool,
    pub control: Option<&'a dyn ControlOps>,
}

/// A language runtime, as the server sees one.
pub trait Runtime: Send + Sync {
    /// Parse the next top-level form out of `src`, returning the form
    /// and the remaining source, or `None` once `src` is exhausted.
    fn read_form<'s>(&self, src: &'s str) -> Result<Option<(Value, &'s str)>, EvalError>;

    /// Evaluate one form under the given context.
    fn eval(&self, ctx: &mut EvalContext<'_>, form: &Value) -> Result<Value, EvalError>;

    /// Print a value readably under the context's printer preferences.
    fn print(&self, prefs: &PrinterPrefs, value: &Value) -> String;

    /// Pretty-print a value, if this runtime carries a pretty printer.
    fn pretty_print(&self, prefs: &PrinterPrefs, value: &Value) -> Option<String>;

    /// Render an evaluation failure for the err stream. `detail`
    /// selects the full cause trace over the one-line form.
    fn format_trace(&self, err: &EvalError, detail: bool) -> String;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stdin_text_reads_lines() {
        let mut stdin = StdinText::new("one\ntwo\nthree");
        assert_eq!(stdin.read_line(), Some(String::from("one")));
        assert_eq!(stdin.read_line(), Some(String::from("two")));
        assert_eq!(stdin.read_line(), Some(String::from("three")));
        assert_eq!(stdin.read_line(), None);
    }

    #[test]
    fn stdin_text_empty_is_eof() {
        let mut stdin = StdinText::new("");
        assert_eq!(stdin.read_line(), None);
    }

    #[test]
    fn stdin_text_keeps_empty_lines() {
        let mut stdin = StdinText::new("a\n\nb\n");
        assert_eq!(stdin.read_line(), Some(String::from("a")));
        assert_eq!(stdin.read_line(), Some(String::from("")));
        assert_eq!(stdin.read_line(), Some(String::from("b")));
        assert_eq!(stdin.read_line(), None);
    }
}
