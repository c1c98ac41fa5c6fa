//! Local toolchain invocations: the preprocessor whose output is streamed to
//! workers, and the full local compile used as the fallback path.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::job::CompileJob;
use crate::remote::OutputRelay;

/// Status reported when a local tool could not be started at all.
pub const EXIT_LOCAL_SPAWN_FAILED: i32 = 127;

/// Compiles a job entirely on this machine.
#[async_trait]
pub trait LocalCompiler: Send + Sync {
    /// Returns the compiler's exit status. Must write `job.output_file` on success.
    ///
    /// Compiler output goes to `relay` when given and is dropped otherwise.
    async fn compile(&self, job: &CompileJob, relay: Option<&dyn OutputRelay>) -> i32;
}

/// Map a process exit to a shell-style status (128 + signal when killed).
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Runs `<program> <args...> -c <input> -o <output>`.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LocalCompiler for CommandCompiler {
    async fn compile(&self, job: &CompileJob, relay: Option<&dyn OutputRelay>) -> i32 {
        tracing::info!(
            input = %job.input_file.display(),
            output = %job.output_file.display(),
            compiler = %self.program,
            "Compiling locally"
        );

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg("-c")
            .arg(&job.input_file)
            .arg("-o")
            .arg(&job.output_file)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => {
                if let Some(relay) = relay {
                    relay.relay(
                        &String::from_utf8_lossy(&output.stdout),
                        &String::from_utf8_lossy(&output.stderr),
                    );
                }
                exit_code(output.status)
            }
            Err(e) => {
                tracing::error!(compiler = %self.program, error = %e, "Local compiler failed to start");
                EXIT_LOCAL_SPAWN_FAILED
            }
        }
    }
}

/// Runs `<program> <args...> <input>` with stdout connected to a pipe.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    program: String,
    args: Vec<String>,
}

impl Preprocessor {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Start preprocessing `job`; the child's stdout carries the preprocessed source.
    pub fn spawn(&self, job: &CompileJob) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(&job.input_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Language;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Captured(Mutex<Vec<(String, String)>>);

    impl OutputRelay for Captured {
        fn relay(&self, stdout: &str, stderr: &str) {
            self.0
                .lock()
                .unwrap()
                .push((stdout.to_string(), stderr.to_string()));
        }
    }

    fn noisy_compiler() -> CommandCompiler {
        CommandCompiler::new("sh", ["-c", "echo built; echo 'warning: unused' >&2; exit 1", "sh"])
    }

    #[tokio::test]
    async fn preprocessor_output_is_piped() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.c");
        std::fs::write(&input, "int x = 1;\n").unwrap();
        let job = CompileJob::new(&input, dir.path().join("a.o"), Language::C);

        let mut child = Preprocessor::new("cat", Vec::<String>::new()).spawn(&job).unwrap();
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();

        assert_eq!(out, "int x = 1;\n");
        assert_eq!(exit_code(child.wait().await.unwrap()), 0);
    }

    #[tokio::test]
    async fn missing_compiler_reports_spawn_failure() {
        let job = CompileJob::new("/nonexistent/a.c", "/nonexistent/a.o", Language::C);
        let compiler = CommandCompiler::new("fleetcc-no-such-compiler-12345", Vec::<String>::new());

        assert_eq!(compiler.compile(&job, None).await, EXIT_LOCAL_SPAWN_FAILED);
    }

    #[tokio::test]
    async fn compiler_exit_status_is_returned() {
        // `sh -c 'exit 3' -c <input> -o <output>` ignores the trailing arguments
        let job = CompileJob::new("/tmp/a.c", "/tmp/a.o", Language::C);
        let compiler = CommandCompiler::new("sh", ["-c", "exit 3", "sh"]);

        assert_eq!(compiler.compile(&job, None).await, 3);
    }

    #[tokio::test]
    async fn compiler_output_goes_to_the_relay() {
        let job = CompileJob::new("/tmp/a.c", "/tmp/a.o", Language::C);
        let captured = Captured::default();

        assert_eq!(noisy_compiler().compile(&job, Some(&captured)).await, 1);
        assert_eq!(
            *captured.0.lock().unwrap(),
            vec![("built\n".to_string(), "warning: unused\n".to_string())]
        );
    }

    #[tokio::test]
    async fn compiler_output_is_dropped_without_a_relay() {
        // Output is captured rather than inherited; only the status survives
        let job = CompileJob::new("/tmp/a.c", "/tmp/a.o", Language::C);
        assert_eq!(noisy_compiler().compile(&job, None).await, 1);
    }
}
