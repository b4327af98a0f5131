// sitevault/src/pipeline.rs
use std::future::Future;

use crate::errors::{Result, VaultError};
use crate::operation::OperationLog;

/// What a failed step does to the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// The error is logged and propagated; nothing after the step runs.
    AbortOnError,
    /// The error is logged as a warning and the next step runs.
    ContinueOnError,
}

/// Runs the steps of one operation in order, applying the current policy to
/// each failure.
pub struct Pipeline<'a> {
    log: &'a OperationLog,
    policy: StepPolicy,
    failed_steps: Vec<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(log: &'a OperationLog) -> Self {
        Pipeline {
            log,
            policy: StepPolicy::AbortOnError,
            failed_steps: Vec::new(),
        }
    }

    pub fn set_policy(&mut self, policy: StepPolicy) {
        self.policy = policy;
    }

    /// Steps that failed under `ContinueOnError`.
    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    /// Runs a step whose output later steps depend on. Its failure always aborts.
    pub async fn must<T, F>(&mut self, name: &str, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let policy = self.policy;
        self.policy = StepPolicy::AbortOnError;
        let outcome = self.step(name, step).await;
        self.policy = policy;
        outcome?.ok_or_else(|| VaultError::InvalidState(format!("{} produced no result", name)))
    }

    /// Runs one step. `Ok(None)` means the step failed and was tolerated.
    pub async fn step<T, F>(&mut self, name: &str, step: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        tracing::debug!("Step started: {}", name);
        match step.await {
            Ok(value) => Ok(Some(value)),
            Err(e) => match self.policy {
                StepPolicy::AbortOnError => {
                    self.log
                        .error(format!("{} failed ({:?}): {}", name, e.class(), e))
                        .await;
                    Err(e)
                }
                StepPolicy::ContinueOnError => {
                    self.log
                        .warn(format!("{} failed, continuing: {}", name, e))
                        .await;
                    self.failed_steps.push(name.to_string());
                    Ok(None)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{LogLevel, OperationKind};
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn test_policy_switch_turns_errors_into_warnings() -> Result<()> {
        let fx = Fixture::new();
        let op = fx.scheduled(OperationKind::Restore).await?;
        let log = fx.site.log_for(&op);
        let mut pipeline = Pipeline::new(&log);

        assert_eq!(pipeline.step("first", async { Ok(1) }).await?, Some(1));
        pipeline.set_policy(StepPolicy::ContinueOnError);
        let tolerated: Option<()> = pipeline
            .step("truncate", async { Err(VaultError::Integrity("locked".into())) })
            .await?;
        assert!(tolerated.is_none());
        assert_eq!(pipeline.failed_steps(), &["truncate".to_string()]);

        pipeline.set_policy(StepPolicy::AbortOnError);
        let aborted: Result<Option<()>> = pipeline
            .step("download", async { Err(VaultError::Transport("503".into())) })
            .await;
        assert!(aborted.is_err());

        let logs = fx.registry.entries(op.id);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Warning);
        assert_eq!(logs[1].level, LogLevel::Error);
        assert!(logs[1].message.contains("TransportFailure"));
        Ok(())
    }
}
