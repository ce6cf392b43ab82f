use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "gradingjobstatus", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// `done` and `error` rows never transition again.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn serializes_lowercase() {
        let value = serde_json::to_value(JobStatus::Processing).unwrap();
        assert_eq!(value, serde_json::json!("processing"));
        assert_eq!(JobStatus::Error.as_str(), "error");
    }
}
