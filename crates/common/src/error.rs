use std::fmt;

#[derive(Debug)]
pub enum GitRepickError {
    IoError(std::io::Error),
    /// Errors from invoking the git CLI that exited with a non-zero status
    GitCliError {
        code: Option<i32>,
        stderr: String,
        args: Vec<String>,
    },
    /// Errors from invoking the patch tool that exited with a non-zero status
    PatchCliError {
        code: Option<i32>,
        stderr: String,
    },
    /// LLM transport failures (network, HTTP status, malformed response body)
    LlmTransport(String),
    JsonError(serde_json::Error),
    Utf8Error(std::str::Utf8Error),
    FromUtf8Error(std::string::FromUtf8Error),
    Generic(String),
}

impl fmt::Display for GitRepickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRepickError::IoError(e) => write!(f, "IO error: {}", e),
            GitRepickError::GitCliError { code, stderr, args } => match code {
                Some(c) => write!(
                    f,
                    "Git CLI ({}) failed with exit code {}: {}",
                    args.join(" "),
                    c,
                    stderr
                ),
                None => write!(f, "Git CLI ({}) failed: {}", args.join(" "), stderr),
            },
            GitRepickError::PatchCliError { code, stderr } => match code {
                Some(c) => write!(f, "patch failed with exit code {}: {}", c, stderr),
                None => write!(f, "patch failed: {}", stderr),
            },
            GitRepickError::LlmTransport(e) => write!(f, "LLM transport error: {}", e),
            GitRepickError::JsonError(e) => write!(f, "JSON error: {}", e),
            GitRepickError::Utf8Error(e) => write!(f, "UTF-8 error: {}", e),
            GitRepickError::FromUtf8Error(e) => write!(f, "From UTF-8 error: {}", e),
            GitRepickError::Generic(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GitRepickError {}

impl From<std::io::Error> for GitRepickError {
    fn from(err: std::io::Error) -> Self {
        GitRepickError::IoError(err)
    }
}

impl From<serde_json::Error> for GitRepickError {
    fn from(err: serde_json::Error) -> Self {
        GitRepickError::JsonError(err)
    }
}

impl From<std::str::Utf8Error> for GitRepickError {
    fn from(err: std::str::Utf8Error) -> Self {
        GitRepickError::Utf8Error(err)
    }
}

impl From<std::string::FromUtf8Error> for GitRepickError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        GitRepickError::FromUtf8Error(err)
    }
}
