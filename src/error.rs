use crate::classfile::ClassFileError;
use crate::env::Jvmti;
use crate::sys::jvmti::jvmtiError;
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} failed: {name} ({})", code.0)]
    Jvmti { op: &'static str, code: jvmtiError, name: String },

    #[error("{op} failed with JNI error {code}")]
    Jni { op: &'static str, code: i32 },

    #[error("cannot obtain a JVMTI environment: GetEnv returned {0}")]
    Env(i32),

    #[error("invalid agent options: {0}")]
    Config(String),

    #[error("malformed class file: {0}")]
    ClassFormat(#[from] ClassFileError),

    #[error("class file load hook delivered a class without a readable name: {0}")]
    ClassName(ClassFileError),

    #[error("cannot instrument {class}: {source}")]
    Rewrite { class: String, source: RewriteError },

    #[error("rewritten class image of {0} bytes does not fit a jint")]
    ImageTooLarge(usize),

    #[error("helper {0} not found; is the helper jar on the boot class path?")]
    HelperMissing(String),

    #[error("agent state is already initialised")]
    AlreadyLoaded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the allocation-site transformer for a single class.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RewriteError {
    #[error("branch at pc {pc} no longer fits a 16-bit offset")]
    BranchOverflow { pc: usize },

    #[error("method code grows to {len} bytes (limit 65535)")]
    CodeTooLarge { len: usize },

    #[error("unknown opcode {opcode:#04x} at pc {pc}")]
    InvalidOpcode { pc: usize, opcode: u8 },

    #[error("instruction at pc {pc} runs past the end of the code")]
    Truncated { pc: usize },

    #[error("offset {offset} does not start an instruction")]
    BadOffset { offset: usize },

    #[error(transparent)]
    Format(#[from] ClassFileError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes used when the agent aborts the VM.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const ENV: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const FATAL: i32 = 3;
}

impl Error {
    /// Builds a host error, translating `code` with `GetErrorName`.
    pub fn jvmti(jvmti: &Jvmti, op: &'static str, code: jvmtiError) -> Self {
        let name = jvmti.get_error_name(code).unwrap_or_else(|_| format!("JVMTI_ERROR {}", code.0));
        Error::Jvmti { op, code, name }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => exit_code::CONFIG,
            Error::Env(_) => exit_code::ENV,
            _ => exit_code::FATAL,
        }
    }
}

/// Reports `err` and terminates the VM process.
pub fn fatal(err: &Error) -> ! {
    if log::log_enabled!(log::Level::Error) {
        log::error!("{err}");
    } else {
        eprintln!("heapster: {err}");
    }
    let _ = std::io::stderr().flush();
    std::process::exit(err.exit_code())
}
