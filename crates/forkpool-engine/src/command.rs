use forkpool_core::{EngineOp, ForkpoolError, Result};
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execute a command and return its output regardless of exit code
///
/// The child is killed if the returned future is dropped, so a caller-side
/// timeout never leaves a stray engine process behind. Only a failure to
/// spawn is an error here; `op` and `path` label it.
pub async fn exec_unchecked(
    program: &str,
    args: &[&str],
    op: EngineOp,
    path: &str,
) -> Result<CommandOutput> {
    debug!("Executing: {} {}", program, args.join(" "));

    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            ForkpoolError::engine(
                op,
                path,
                -1,
                format!("failed to run '{} {}': {}", program, args.join(" "), e),
            )
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    debug!(
        "Command exited with code {}: {} {}",
        exit_code,
        program,
        args.join(" ")
    );

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Execute a command and fail on non-zero exit code
///
/// Output on stdout never turns a failed call into a success.
pub async fn exec(program: &str, args: &[&str], op: EngineOp, path: &str) -> Result<CommandOutput> {
    let output = exec_unchecked(program, args, op, path).await?;

    if !output.success() {
        return Err(classify_failure(op, path, &output));
    }

    Ok(output)
}

/// Map a failed engine call onto the error taxonomy using its stderr
pub fn classify_failure(op: EngineOp, path: &str, output: &CommandOutput) -> ForkpoolError {
    let stderr = output.stderr.trim();
    if stderr.contains("already exists") {
        ForkpoolError::already_exists(path)
    } else if stderr.contains("does not exist") || stderr.contains("could not find") {
        ForkpoolError::not_found("Dataset", path)
    } else {
        ForkpoolError::engine(op, path, output.exit_code, stderr)
    }
}
