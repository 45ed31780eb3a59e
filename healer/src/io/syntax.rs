//! External parser used to validate fixed files.

use std::time::Duration;

use tracing::{debug, warn};

use crate::core::validate::{StructuralCheck, SyntaxCheck};
use crate::io::config::ValidationConfig;
use crate::io::process::TimedCommand;

/// Pipes source into a checker command; exit status 0 means it parses.
///
/// Falls back to [`StructuralCheck`] when the command is unset, cannot be
/// spawned, or times out.
#[derive(Debug, Clone)]
pub struct CommandSyntaxCheck {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSyntaxCheck {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            argv: config.syntax_command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl SyntaxCheck for CommandSyntaxCheck {
    fn parses(&self, source: &str) -> bool {
        let Some((program, args)) = self.argv.split_first() else {
            return StructuralCheck.parses(source);
        };
        let result = TimedCommand::new(program, self.timeout)
            .args(args)
            .stdin(source)
            .capture_limit(16 * 1024)
            .run();
        match result {
            Ok(output) if !output.timed_out => {
                debug!(exit_code = ?output.status.code(), "syntax checker finished");
                output.status.success()
            }
            Ok(_) => {
                warn!("syntax checker timed out, using structural check");
                StructuralCheck.parses(source)
            }
            Err(err) => {
                warn!(err = %err, "syntax checker unavailable, using structural check");
                StructuralCheck.parses(source)
            }
        }
    }
}
