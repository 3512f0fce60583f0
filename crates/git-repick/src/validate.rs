use crate::config;
use common::error::GitRepickError;
use common::utils::{debug_log, run_command_timeout, CommandOutput};
use std::path::Path;
use std::time::Duration;

/// Runs the user's validation command with changed paths appended. Exit 0
/// passes; anything else (including a timeout) rolls the pick back.
#[derive(Debug, Clone)]
pub struct ValidationRunner {
    argv: Vec<String>,
    timeout: Duration,
}

impl ValidationRunner {
    /// Build from the CLI string form: whitespace-separated executable and
    /// fixed arguments.
    pub fn from_command_line(command: &str) -> Result<Self, GitRepickError> {
        let argv: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
        if argv.is_empty() {
            return Err(GitRepickError::Generic(
                "validation command is empty".to_string(),
            ));
        }
        Ok(ValidationRunner {
            argv,
            timeout: Duration::from_secs(config::Config::get().validation_timeout_secs()),
        })
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute with `changed_paths` as the final arguments, from the
    /// repository root.
    pub fn run(
        &self,
        workdir: &Path,
        changed_paths: &[String],
    ) -> Result<CommandOutput, GitRepickError> {
        let mut argv = self.argv.clone();
        argv.extend(changed_paths.iter().cloned());
        debug_log(&format!("running validation command {:?}", argv));
        run_command_timeout(&argv, Some(workdir), None, self.timeout)
    }
}
