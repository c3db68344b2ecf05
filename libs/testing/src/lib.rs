//! Test doubles shared across the workspace.

use std::sync::Mutex;

use async_trait::async_trait;
use migrant_command::{CommandError, CommandRunner, Invocation};

/// A [`CommandRunner`] that records every invocation instead of running it.
///
/// Invocations succeed with empty output unless a failure rule matches.
/// A rule matches when the rendered command line contains its needle.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    failures: Mutex<Vec<FailureRule>>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    needle: String,
    output: String,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every invocation whose command line contains `needle`.
    pub fn fail_when(&self, needle: &str, output: &str) {
        self.failures.lock().unwrap().push(FailureRule {
            needle: needle.to_string(),
            output: output.to_string(),
        });
    }

    /// All recorded invocations, in call order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded invocations rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Number of recorded invocations of `program`.
    pub fn count(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        self.calls.lock().unwrap().push(invocation.clone());

        let line = invocation.to_string();
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|rule| line.contains(&rule.needle))
            .cloned();

        match failure {
            Some(rule) => Err(CommandError::Failed {
                command: line,
                status: "exit status: 1".to_string(),
                output: rule.output,
            }),
            None => Ok(String::new()),
        }
    }
}
