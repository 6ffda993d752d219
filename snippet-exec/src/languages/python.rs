use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{error::Error, languages::LanguageExecutor, types::LimitExceeded};

const SOURCE_FILE: &str = "main.py";

/// Runs `main.py` in a fresh namespace.
///
/// `input()` is replaced so a read past the end of the supplied stdin
/// returns `""` instead of raising `EOFError`, and the bootstrap's own frame
/// is dropped from tracebacks.
const BOOTSTRAP: &str = r#"
import builtins, sys, traceback

def _input(prompt=""):
    if prompt:
        sys.stdout.write(str(prompt))
        sys.stdout.flush()
    line = sys.stdin.readline()
    if line.endswith("\n"):
        line = line[:-1]
    return line

builtins.input = _input

with open("main.py", encoding="utf-8") as _f:
    _source = _f.read()

_namespace = {"__name__": "__main__", "__builtins__": builtins}
try:
    exec(compile(_source, "main.py", "exec"), _namespace)
except SystemExit:
    raise
except BaseException as _exc:
    traceback.print_exception(type(_exc), _exc, _exc.__traceback__.tb_next)
    sys.exit(1)
"#;

pub struct PythonExecutor {
    interpreter: PathBuf,
}

impl PythonExecutor {
    /// Resolve the interpreter once; every execution reuses the path, never the process.
    pub fn new(interpreter: &str) -> Result<Self, Error> {
        let interpreter = super::resolve_tool(interpreter)?;
        debug!("Using Python interpreter at {}", interpreter.display());
        Ok(Self { interpreter })
    }
}

#[async_trait]
impl LanguageExecutor for PythonExecutor {
    fn source_file_name(&self) -> &str {
        SOURCE_FILE
    }

    fn run_command(&self) -> &Path {
        &self.interpreter
    }

    fn run_args(&self) -> Vec<String> {
        // -I: no user site, no PYTHON* env, no cwd on sys.path
        // -B: no .pyc files in the sandbox
        ["-I", "-B", "-X", "utf8", "-c", BOOTSTRAP]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn detect_resource_exhaustion(&self, stderr: &str) -> Option<LimitExceeded> {
        let last = stderr.lines().rev().find(|line| !line.trim().is_empty())?;
        // Allocation failures carry no message; `raise MemoryError("...")` is the code's own error
        if last.trim_end() == "MemoryError" {
            Some(LimitExceeded::Memory)
        } else if last.contains("[Errno 27] File too large") {
            // CPython ignores SIGXFSZ, so RLIMIT_FSIZE surfaces as EFBIG
            Some(LimitExceeded::FileSize)
        } else {
            None
        }
    }
}
