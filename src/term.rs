//! Terminal environment: TTY flags, color, pager, clipboard, editor.
//!
//! Everything environment-dependent is read once at startup into
//! [`TermEnv`] and passed into the core, so the pipeline never consults
//! ambient globals.

use crate::error::Error;
use std::io::{IsTerminal, Write as _};
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Inline-image protocols this terminal might speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProtocol {
    Kitty,
    Iterm2,
}

/// A snapshot of the terminal-relevant environment.
#[derive(Debug, Clone)]
pub struct TermEnv {
    pub stdin_tty: bool,
    pub stdout_tty: bool,
    pub stderr_tty: bool,
    pub color: bool,
    pub truecolor: bool,
    pub image_protocol: Option<ImageProtocol>,
}

impl TermEnv {
    pub fn detect() -> Self {
        let stdout_tty = std::io::stdout().is_terminal();
        let no_color = std::env::var_os("NO_COLOR").is_some();
        Self {
            stdin_tty: std::io::stdin().is_terminal(),
            stdout_tty,
            stderr_tty: std::io::stderr().is_terminal(),
            color: stdout_tty && !no_color,
            truecolor: matches!(
                std::env::var("COLORTERM").as_deref(),
                Ok("truecolor") | Ok("24bit")
            ),
            image_protocol: detect_image_protocol(),
        }
    }

    /// A non-terminal environment for tests and `--output` paths.
    pub fn plain() -> Self {
        Self {
            stdin_tty: false,
            stdout_tty: false,
            stderr_tty: false,
            color: false,
            truecolor: false,
            image_protocol: None,
        }
    }
}

/// Probe the terminal emulator for an inline-image protocol.
fn detect_image_protocol() -> Option<ImageProtocol> {
    if std::env::var_os("KITTY_PID").is_some()
        || std::env::var("TERM").is_ok_and(|t| t.contains("kitty"))
    {
        return Some(ImageProtocol::Kitty);
    }
    match std::env::var("TERM_PROGRAM").as_deref() {
        Ok("iTerm.app") | Ok("WezTerm") | Ok("mintty") => return Some(ImageProtocol::Iterm2),
        _ => {}
    }
    // Windows Terminal renders neither protocol.
    if std::env::var_os("WT_SESSION").is_some() {
        return None;
    }
    None
}

/// Spawn `less -FIRX` for paged output. Returns `None` when no pager is
/// available; the caller falls back to direct writes.
pub fn spawn_pager() -> Option<Child> {
    match Command::new("less")
        .arg("-FIRX")
        .stdin(Stdio::piped())
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            debug!("pager unavailable: {}", e);
            None
        }
    }
}

/// Platform clipboard tools, in preference order.
fn clipboard_commands() -> &'static [(&'static str, &'static [&'static str])] {
    if cfg!(target_os = "macos") {
        &[("pbcopy", &[])]
    } else if cfg!(windows) {
        &[("clip.exe", &[])]
    } else {
        &[
            ("wl-copy", &[]),
            ("xclip", &["-selection", "clipboard"]),
            ("xsel", &["--clipboard", "--input"]),
        ]
    }
}

/// Copy bytes to the system clipboard via the first working tool. A
/// missing tool is a warning, not a failure.
pub fn copy_to_clipboard(data: &[u8]) -> Result<(), Error> {
    for (cmd, args) in clipboard_commands() {
        let child = Command::new(cmd)
            .args(*args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(c) => c,
            Err(_) => continue,
        };
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(data)?;
        }
        drop(child.stdin.take());
        let status = child.wait()?;
        if status.success() {
            debug!("copied {} byte(s) via {}", data.len(), cmd);
            return Ok(());
        }
    }
    warn!("no clipboard tool found; skipping --copy");
    Ok(())
}

/// Editor fallbacks when neither `VISUAL` nor `EDITOR` is set.
const EDITOR_FALLBACKS: &[&str] = &["vim", "vi", "nano", "notepad.exe"];

/// Open the body in the user's editor and return the edited bytes.
pub fn edit_body(initial: &[u8], suffix: &str) -> Result<Vec<u8>, Error> {
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .ok()
        .filter(|e| !e.is_empty());

    let candidates: Vec<String> = match editor {
        Some(e) => vec![e],
        None => EDITOR_FALLBACKS.iter().map(|s| s.to_string()).collect(),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix("snag-body-")
        .suffix(suffix)
        .tempfile()?;
    tmp.write_all(initial)?;
    tmp.flush()?;

    for candidate in &candidates {
        // VISUAL/EDITOR may carry arguments ("code --wait").
        let mut parts = candidate.split_whitespace();
        let Some(program) = parts.next() else { continue };
        let status = Command::new(program)
            .args(parts)
            .arg(tmp.path())
            .status();
        match status {
            Ok(status) if status.success() => {
                return Ok(std::fs::read(tmp.path())?);
            }
            Ok(status) => {
                return Err(Error::Input(format!("editor exited with {status}")));
            }
            Err(_) => continue,
        }
    }
    Err(Error::Input("no usable editor found (set VISUAL or EDITOR)".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_env_is_inert() {
        let env = TermEnv::plain();
        assert!(!env.stdout_tty);
        assert!(!env.color);
        assert!(env.image_protocol.is_none());
    }

    #[test]
    fn test_clipboard_command_table_nonempty() {
        assert!(!clipboard_commands().is_empty());
    }
}
