use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    NotExecuted,
    Uncertain,
    Failed,
}

impl CommandOutcome {
    pub fn is_retry_safe(self) -> bool {
        matches!(self, CommandOutcome::NotExecuted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandOutcome::NotExecuted => "not_executed",
            CommandOutcome::Uncertain => "uncertain",
            CommandOutcome::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_executed_is_retry_safe() {
        assert!(CommandOutcome::NotExecuted.is_retry_safe());
        assert!(!CommandOutcome::Uncertain.is_retry_safe());
        assert!(!CommandOutcome::Failed.is_retry_safe());
        assert_eq!(
            serde_json::to_value(CommandOutcome::NotExecuted).expect("encode"),
            serde_json::json!("not_executed")
        );
    }
}
