//! Script sync (§4.8)
//!
//! Upload-or-reference → interpreter resolution → exec/source command
//! construction → streaming or pseudo-interactive run → cleanup. No source
//! body was retrieved for `domain/sync/script_exec.py` (only its header),
//! so this is built directly from §4.8, reusing
//! [`crate::ssh::SshClient::exec_streaming`] and
//! [`crate::ssh::SshClient::exec_interactive`] for the run step.

use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use crate::sync::models::{ExecMode, GlobalEnv, ScriptExec};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of running one script: combined stdout/stderr and the exit code.
pub struct ScriptOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Resolves which interpreter runs the script, in priority order: explicit
/// `interpreter` field → local-file shebang (if the script is a local
/// upload) → the global default (§4.8 step 3).
fn resolve_interpreter(script: &ScriptExec, global_env: &GlobalEnv) -> String {
    if let Some(interp) = &script.interpreter {
        return interp.clone();
    }
    if !script.is_remote_src() {
        if let Some(shebang) = read_shebang(&script.src) {
            return shebang;
        }
    }
    global_env.interpreter.clone()
}

fn read_shebang(local_path: &str) -> Option<String> {
    let mut file = std::fs::File::open(local_path).ok()?;
    let mut buf = [0u8; 256];
    let n = file.read(&mut buf).ok()?;
    let head = std::str::from_utf8(&buf[..n]).ok()?;
    let first_line = head.lines().next()?;
    let rest = first_line.strip_prefix("#!")?;
    Some(rest.trim().to_string())
}

/// Builds the command line to run on the remote (§4.8 step 4).
fn build_command(script: &ScriptExec, remote_path: &str, interpreter: &str, global_env: &GlobalEnv) -> String {
    let flags = script.flags.clone().unwrap_or_default().join(" ");
    let args = script.args.clone().unwrap_or_default().join(" ");

    match script.exec_mode {
        ExecMode::Exec => {
            let mut parts = vec![interpreter.to_string()];
            if !flags.is_empty() {
                parts.push(flags);
            }
            parts.push(remote_path.to_string());
            if !args.is_empty() {
                parts.push(args);
            }
            parts.join(" ")
        }
        ExecMode::Source => {
            let global_flags = global_env.flags.clone().unwrap_or_default().join(" ");
            let mut inner = format!("source {}", remote_path);
            if !args.is_empty() {
                inner.push(' ');
                inner.push_str(&args);
            }
            let mut parts = vec![global_env.interpreter.clone()];
            if !global_flags.is_empty() {
                parts.push(global_flags);
            }
            parts.push("-c".to_string());
            parts.push(format!("\"{}\"", inner));
            parts.join(" ")
        }
    }
}

/// Uploads `local_path` to a temp path on the remote and chmods it 0755
/// (§4.8 step 2).
fn upload_script(client: &SshClient, local_path: &str) -> Result<String> {
    let sftp = client.open_fresh_sftp()?;
    let file_name = Path::new(local_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("script");
    let remote_path = format!("/tmp/.remote-script-{}-{}", std::process::id(), file_name);

    let contents = std::fs::read(local_path).map_err(|e| RemoteError::io(local_path, e))?;
    let mut remote_file = sftp
        .create(Path::new(&remote_path))
        .map_err(|e| RemoteError::ScriptExecutionError(format!("failed to upload script: {}", e)))?;
    use std::io::Write;
    remote_file
        .write_all(&contents)
        .map_err(|e| RemoteError::ScriptExecutionError(format!("failed to write uploaded script: {}", e)))?;
    drop(remote_file);

    sftp.setstat(
        Path::new(&remote_path),
        ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(0o755),
            atime: None,
            mtime: None,
        },
    )
    .map_err(|e| RemoteError::ScriptExecutionError(format!("failed to chmod uploaded script: {}", e)))?;

    Ok(remote_path)
}

/// Runs one [`ScriptExec`] against an already-connected client, returning
/// its output (§4.8 steps 2-6). Deletes any file it uploaded on the way
/// out, ignoring deletion errors (step 7).
pub fn run_script(script: &ScriptExec, client: &SshClient, global_env: &GlobalEnv) -> Result<ScriptOutput> {
    let (remote_path, uploaded) = if script.is_remote_src() {
        (script.remote_src_path().to_string(), false)
    } else {
        (upload_script(client, &script.src)?, true)
    };

    let interpreter = resolve_interpreter(script, global_env);
    let command = build_command(script, &remote_path, &interpreter, global_env);
    debug!(command = %command, "running script");

    let run_result = if script.interactive {
        run_interactive(client, &command)
    } else {
        run_streaming(client, &command)
    };

    if uploaded {
        let cleanup = client.exec(&format!("rm -f {}", remote_path));
        if let Err(e) = cleanup {
            warn!(remote_path = %remote_path, error = %e, "failed to clean up uploaded script");
        }
    }

    let output = run_result?;

    if output.exit_code != 0 && !script.allow_fail {
        return Err(RemoteError::ScriptExecutionError(format!(
            "{} exited with code {}",
            script.src, output.exit_code
        )));
    }

    Ok(output)
}

fn run_streaming(client: &SshClient, command: &str) -> Result<ScriptOutput> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = client.exec_streaming(
        command,
        |chunk| stdout.extend_from_slice(chunk),
        |chunk| stderr.extend_from_slice(chunk),
    )?;
    Ok(ScriptOutput { stdout, stderr, exit_code })
}

/// Pseudo-interactive run (§9b): no real PTY, just a shell channel with the
/// command followed by `exit\n`, drained under a 60s wall-clock deadline.
fn run_interactive(client: &SshClient, command: &str) -> Result<ScriptOutput> {
    let mut stdout = Vec::new();
    let exit_code = client.exec_interactive(command, |chunk| stdout.extend_from_slice(chunk), INTERACTIVE_TIMEOUT)?;
    Ok(ScriptOutput { stdout, stderr: Vec::new(), exit_code })
}

/// Runs every script in order. Unlike [`crate::sync::block_sync::sync_block_groups`],
/// a single script's non-zero exit (when `allow_fail` is false) aborts the
/// whole run immediately — per §4.8 step 6 this is an unrecoverable
/// `ScriptExecutionError`, not a per-item skip.
pub fn run_scripts(scripts: &[ScriptExec], client: &SshClient, global_env: &GlobalEnv) -> Result<()> {
    for script in scripts {
        let output = run_script(script, client, global_env)?;
        if output.exit_code != 0 {
            debug!(src = %script.src, code = output.exit_code, "script failed but allow_fail permitted continuing");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::ScriptMode;
    use tempfile::NamedTempFile;

    fn script(src: &str, exec_mode: ExecMode) -> ScriptExec {
        ScriptExec {
            src: src.to_string(),
            mode: ScriptMode::Always,
            exec_mode,
            interpreter: None,
            flags: None,
            args: None,
            interactive: false,
            allow_fail: false,
        }
    }

    #[test]
    fn build_command_exec_mode() {
        let s = script("setup.sh", ExecMode::Exec);
        let cmd = build_command(&s, "/tmp/setup.sh", "/bin/bash", &GlobalEnv::default());
        assert_eq!(cmd, "/bin/bash /tmp/setup.sh");
    }

    #[test]
    fn build_command_source_mode() {
        let s = script("setup.sh", ExecMode::Source);
        let cmd = build_command(&s, "/tmp/setup.sh", "/bin/bash", &GlobalEnv::default());
        assert_eq!(cmd, "/bin/bash -c \"source /tmp/setup.sh\"");
    }

    #[test]
    fn build_command_includes_args() {
        let mut s = script("setup.sh", ExecMode::Exec);
        s.args = Some(vec!["--flag".into(), "value".into()]);
        let cmd = build_command(&s, "/tmp/setup.sh", "/bin/bash", &GlobalEnv::default());
        assert_eq!(cmd, "/bin/bash /tmp/setup.sh --flag value");
    }

    #[test]
    fn resolve_interpreter_prefers_explicit() {
        let mut s = script("setup.sh", ExecMode::Exec);
        s.interpreter = Some("/usr/bin/python3".into());
        let interp = resolve_interpreter(&s, &GlobalEnv::default());
        assert_eq!(interp, "/usr/bin/python3");
    }

    #[test]
    fn resolve_interpreter_falls_back_to_shebang() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "#!/usr/bin/env python3\nprint('hi')\n").unwrap();
        let s = script(file.path().to_str().unwrap(), ExecMode::Exec);
        let interp = resolve_interpreter(&s, &GlobalEnv::default());
        assert_eq!(interp, "/usr/bin/env python3");
    }

    #[test]
    fn resolve_interpreter_global_default_for_remote_src() {
        let s = script(":/opt/scripts/run.sh", ExecMode::Exec);
        let interp = resolve_interpreter(&s, &GlobalEnv::default());
        assert_eq!(interp, "/bin/bash");
    }
}
