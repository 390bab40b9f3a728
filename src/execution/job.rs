//! Individual Job Execution
//!
//! Runs the action of a single job:
//! - Input existence check
//! - Output directory creation
//! - Script generation and execution under bash
//! - Output verification

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::SystemTime;

use log::{debug, error, warn};

use crate::error::JobExecutionError;
use crate::workflow::Job;

/// Executes a job's action.
///
/// Relative paths in the job are interpreted against `working_dir`,
/// which is also where the action runs unless the job sets its own work
/// directory.
///
/// # Returns
///
/// * `Ok(())` - The command succeeded and the output exists
/// * `Err` - An input was missing, the command failed, or it did not
///   create its output
pub fn execute_job(job: &Job, working_dir: Option<&Path>) -> Result<(), JobExecutionError> {
    let label = job.label();
    let resolve = |path: &Path| -> PathBuf {
        match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    };
    let io_err = |source: io::Error| JobExecutionError::Io {
        job: label.clone(),
        source,
    };

    for input in job.input_paths() {
        if !resolve(input).exists() {
            return Err(JobExecutionError::MissingInput {
                job: label.clone(),
                path: input.clone(),
            });
        }
    }

    let output = resolve(&job.output);
    prepare_output(&output, job.output_is_dir).map_err(io_err)?;

    let run_dir = match &job.workdir {
        Some(dir) => {
            let dir = resolve(dir);
            fs::create_dir_all(&dir).map_err(io_err)?;
            Some(dir)
        }
        None => working_dir.map(Path::to_path_buf),
    };

    let script_path = create_execution_script(job.id, &job.command).map_err(io_err)?;
    let result = run_script(&script_path, run_dir.as_deref());

    if let Err(e) = fs::remove_file(&script_path) {
        warn!("Failed to clean up script {}: {}", script_path.display(), e);
    }

    let output_capture = result.map_err(io_err)?;
    let stdout = String::from_utf8_lossy(&output_capture.stdout);
    let stderr = String::from_utf8_lossy(&output_capture.stderr);

    if !output_capture.status.success() {
        let status = describe_status(&output_capture.status);
        error!("Job {} failed ({})", label, status);
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }
        return Err(JobExecutionError::Failed {
            job: label,
            command: job.command.clone(),
            status,
            stderr: stderr.into_owned(),
        });
    }

    if !stdout.trim().is_empty() {
        debug!("Job {} output:\n{}", label, stdout);
    }

    if !output.exists() {
        return Err(JobExecutionError::MissingOutput {
            job: label,
            path: job.output.clone(),
        });
    }

    // Writing inside a directory leaves its own mtime alone.
    touch(&output).map_err(io_err)?;

    debug!("Job {} completed successfully", label);
    Ok(())
}

/// Creates the directories an output needs before the action runs.
fn prepare_output(output: &Path, is_dir: bool) -> io::Result<()> {
    let dir = if is_dir { Some(output) } else { output.parent() };
    if let Some(dir) = dir {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
            debug!("Created directory: {}", dir.display());
        }
    }
    Ok(())
}

/// Stamps a finished output with the current time, so it is never older
/// than the inputs it was built from.
fn touch(path: &Path) -> io::Result<()> {
    File::open(path)?.set_modified(SystemTime::now())
}

/// Writes the command to a temporary bash script.
fn create_execution_script(job_id: usize, command_text: &str) -> io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("slidegraph_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("job_{}_{}.sh", std::process::id(), job_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn run_script(script_path: &Path, dir: Option<&Path>) -> io::Result<std::process::Output> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path);

    if let Some(dir) = dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    cmd.output()
}

/// Describes how a process ended: exit code or terminating signal.
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }

    "terminated abnormally".to_string()
}
