use crate::error::GitRepickError;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

static DEBUG_ENABLED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();

fn is_debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        std::env::var("GIT_REPICK_DEBUG").unwrap_or_default() == "1"
            || (cfg!(debug_assertions)
                && std::env::var("GIT_REPICK_DEBUG").unwrap_or_default() != "0")
    })
}

pub fn debug_log(msg: &str) {
    if is_debug_enabled() {
        eprintln!("\x1b[1;33m[git-repick]\x1b[0m {}", msg);
    }
}

/// Captured result of a subprocess that is allowed to fail.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// True when the process was killed because it ran past its deadline.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }
}

/// Run a command to completion, capturing both streams.
///
/// Unlike the git adapter this never turns a non-zero exit into an error;
/// callers that care inspect `CommandOutput::success`.
pub fn run_command(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    stdin_data: Option<&[u8]>,
) -> Result<CommandOutput, GitRepickError> {
    run_command_with_deadline(argv, cwd, stdin_data, None)
}

/// Run a command with a wall-clock deadline. The child is polled with
/// `try_wait` and killed once the deadline passes.
pub fn run_command_timeout(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    stdin_data: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, GitRepickError> {
    run_command_with_deadline(argv, cwd, stdin_data, Some(timeout))
}

fn run_command_with_deadline(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    stdin_data: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, GitRepickError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GitRepickError::Generic("empty command line".to_string()))?;
    debug_log(&format!("Running command {:?} ...", argv));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(GitRepickError::IoError)?;

    // Drain both pipes on threads before feeding stdin, so a chatty child
    // cannot fill a pipe and deadlock against us.
    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit without draining stdin; a broken pipe here is
            // part of its answer, not ours to report.
            let _ = stdin.write_all(data);
        }
    }

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait().map_err(GitRepickError::IoError)? {
            Some(status) => break status,
            None => {
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        let _ = child.kill();
                        timed_out = true;
                        break child.wait().map_err(GitRepickError::IoError)?;
                    }
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    };

    let stdout = join_reader(stdout_handle);
    let stderr = join_reader(stderr_handle);

    debug_log(&format!(
        "Command {:?} returned {:?}{}",
        argv,
        status.code(),
        if timed_out { " (timed out)" } else { "" }
    ));

    Ok(CommandOutput {
        code: status.code(),
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Levenshtein distance between two strings, used to bound how far an
/// LLM-proposed change may drift from the rejected hunk.
pub fn edit_distance(src: &str, dst: &str) -> usize {
    let src: Vec<char> = src.chars().collect();
    let dst: Vec<char> = dst.chars().collect();
    if src.is_empty() {
        return dst.len();
    }
    if dst.is_empty() {
        return src.len();
    }

    let mut prev: Vec<usize> = (0..=dst.len()).collect();
    let mut cur = vec![0usize; dst.len() + 1];

    for (i, sc) in src.iter().enumerate() {
        cur[0] = i + 1;
        for (j, dc) in dst.iter().enumerate() {
            let substitution = prev[j] + usize::from(sc != dc);
            cur[j + 1] = substitution.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[dst.len()]
}

/// Unescape a git-quoted path.
///
/// Git wraps paths containing non-ASCII or special characters in double
/// quotes and encodes the offending bytes C-style, with `\NNN` octal
/// sequences for anything outside the printable range. Unquoted paths are
/// returned unchanged.
pub fn unescape_git_path(path: &str) -> String {
    let quoted = path.len() >= 2 && path.starts_with('"') && path.ends_with('"');
    if !quoted {
        return path.to_string();
    }

    let inner = path[1..path.len() - 1].as_bytes();
    let mut bytes: Vec<u8> = Vec::with_capacity(inner.len());

    let mut i = 0;
    while i < inner.len() {
        if inner[i] != b'\\' {
            bytes.push(inner[i]);
            i += 1;
            continue;
        }
        match inner.get(i + 1).copied() {
            // Up to three octal digits reassemble one raw byte.
            Some(b'0'..=b'7') => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 3 {
                    match inner.get(i + 1 + digits).copied() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                if value <= 0xff {
                    bytes.push(value as u8);
                }
                i += 1 + digits;
            }
            Some(b'n') => {
                bytes.push(b'\n');
                i += 2;
            }
            Some(b't') => {
                bytes.push(b'\t');
                i += 2;
            }
            Some(b'r') => {
                bytes.push(b'\r');
                i += 2;
            }
            Some(c) if c == b'\\' || c == b'"' => {
                bytes.push(c);
                i += 2;
            }
            // Unknown escape or trailing backslash: keep the backslash and
            // let the next byte speak for itself.
            _ => {
                bytes.push(b'\\');
                i += 1;
            }
        }
    }

    match String::from_utf8(bytes) {
        Ok(unescaped) => unescaped,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
