use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

pub fn run(script: &str) -> Result<String> {
    run_lines_with_args(&[script], &[])
}

/// Runs a multi-line script, passing `args` as `argv` so quoting in the
/// values cannot break the script.
pub fn run_lines_with_args(lines: &[&str], args: &[String]) -> Result<String> {
    let mut cmd = Command::new("osascript");
    for line in lines {
        cmd.arg("-e").arg(line);
    }
    if !args.is_empty() {
        cmd.arg("--");
        for arg in args {
            cmd.arg(arg);
        }
    }

    let output = cmd.output().context("Failed to run AppleScript")?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(anyhow!("AppleScript Error: {}", stderr));
    }

    Ok(stdout)
}

pub fn set_clipboard(text: &str) -> Result<()> {
    let mut child = Command::new("pbcopy")
        .stdin(Stdio::piped())
        .spawn()
        .context("Failed to run pbcopy")?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(text.as_bytes()).context("Failed to write to pbcopy")?;
    }
    let status = child.wait().context("pbcopy did not exit")?;
    if !status.success() {
        return Err(anyhow!("pbcopy failed"));
    }
    Ok(())
}
