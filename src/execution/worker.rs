//! Worker Side of Callable Tasks
//!
//! A host program registers its callables in a [`Registry`] and, when
//! invoked with [`WORKER_ARG`], hands control to [`serve`]. The worker
//! reads one [`CallRequest`] from stdin, runs the callable, writes one
//! framed [`CallReply`] to stdout and exits.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use bear::execution::worker::{self, Registry, WORKER_ARG};
//!
//! fn main() -> ExitCode {
//!     let mut registry = Registry::new();
//!     registry.register("double", |args, _| {
//!         let n = args.first().and_then(|v| v.as_i64()).ok_or("expected a number")?;
//!         Ok((n * 2).into())
//!     });
//!
//!     if std::env::args().nth(1).as_deref() == Some(WORKER_ARG) {
//!         return worker::serve(&registry);
//!     }
//!     // ... regular program, dispatching `Caller::function("double")` ...
//!     ExitCode::SUCCESS
//! }
//! ```

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::Once;

use log::debug;
use serde_json::{Map, Value};

use super::protocol::{encode_reply, CallReply, CallRequest};

/// Command-line argument that switches a host program into worker mode.
pub const WORKER_ARG: &str = "__bear-worker";

/// Exit status when the callable failed.
const EXIT_CALL_FAILED: u8 = 1;

/// Exit status when the request could not be read or decoded.
const EXIT_BAD_REQUEST: u8 = 2;

/// A registered function: positional and keyword arguments in, JSON
/// value or error text out.
pub type Callable = Box<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value, String> + Send + Sync>;

static PANIC_HOOK: Once = Once::new();

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Named callables a worker can run.
#[derive(Default)]
pub struct Registry {
    functions: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs the requested function, turning errors and panics into an
    /// error reply.
    pub fn call(&self, request: &CallRequest) -> CallReply {
        let Some(function) = self.functions.get(&request.function) else {
            return CallReply::err(format!(
                "unknown function '{}' (registered: {})",
                request.function,
                self.names().join(", ")
            ));
        };

        install_panic_hook();
        debug!("Worker calling {}{:?}", request.function, request.args);

        match panic::catch_unwind(AssertUnwindSafe(|| function(&request.args, &request.kwargs))) {
            Ok(Ok(result)) => CallReply::ok(result),
            Ok(Err(error)) => CallReply::err(error),
            Err(payload) => {
                let trace = LAST_PANIC.with(|last| last.borrow_mut().take());
                CallReply::err(trace.unwrap_or_else(|| panic_message(payload.as_ref())))
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Serves one call on this process's stdin/stdout.
pub fn serve(registry: &Registry) -> ExitCode {
    let stdin = io::stdin();
    let stdout = io::stdout();
    ExitCode::from(serve_io(registry, stdin.lock(), stdout.lock()))
}

/// Serves one call on the given streams and returns the exit status.
///
/// The reply is always written and flushed, even when the request is
/// unreadable or the callable fails.
pub fn serve_io<R: Read, W: Write>(registry: &Registry, mut input: R, mut output: W) -> u8 {
    let mut text = String::new();
    let (reply, code) = match input.read_to_string(&mut text) {
        Err(e) => (CallReply::err(format!("failed to read call request: {}", e)), EXIT_BAD_REQUEST),
        Ok(_) => match serde_json::from_str::<CallRequest>(&text) {
            Err(e) => (CallReply::err(format!("invalid call request: {}", e)), EXIT_BAD_REQUEST),
            Ok(request) => {
                let reply = registry.call(&request);
                let code = if reply.is_error() { EXIT_CALL_FAILED } else { 0 };
                (reply, code)
            }
        },
    };

    let framed = match encode_reply(&reply) {
        Ok(framed) => framed,
        Err(e) => {
            eprintln!("worker failed to encode reply: {}", e);
            return EXIT_CALL_FAILED.max(code);
        }
    };
    if let Err(e) = output.write_all(framed.as_bytes()).and_then(|_| output.flush()) {
        eprintln!("worker failed to send reply: {}", e);
        return EXIT_CALL_FAILED.max(code);
    }
    code
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = format!("{}\n{}", info, Backtrace::force_capture());
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
