//! Structured task identifiers.
//!
//! The control plane assigns task ids of the form
//! `{execution_id}_{step_id}_{host_id}_{random}`. The server parses these
//! fields out to annotate bus records for downstream aggregation, but
//! nothing depends on a successful parse.

/// Fields recovered from a structured task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskKey {
    pub execution_id: String,
    pub step_id: String,
    /// 0 when absent or unparsable.
    pub host_id: i64,
}

impl TaskKey {
    /// Best-effort parse. Returns `None` only for an empty id; partial ids
    /// yield whatever fields are present.
    pub fn parse(task_id: &str) -> Option<TaskKey> {
        let trimmed = task_id.trim();
        if trimmed.is_empty() {
            return None;
        }
        let parts: Vec<&str> = trimmed.split('_').collect();
        if parts[0].is_empty() {
            return None;
        }

        let mut key = TaskKey {
            execution_id: parts[0].to_string(),
            ..Default::default()
        };
        if parts.len() >= 2 {
            key.step_id = parts[1].to_string();
        }
        if parts.len() >= 3 {
            key.host_id = parts[2].parse().unwrap_or(0);
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_id() {
        let key = TaskKey::parse("exec42_step3_17_a1b2c3").unwrap();
        assert_eq!(key.execution_id, "exec42");
        assert_eq!(key.step_id, "step3");
        assert_eq!(key.host_id, 17);
    }

    #[test]
    fn test_parse_partial_and_invalid() {
        assert!(TaskKey::parse("").is_none());
        assert!(TaskKey::parse("  ").is_none());

        let key = TaskKey::parse("solo").unwrap();
        assert_eq!(key.execution_id, "solo");
        assert_eq!(key.host_id, 0);

        // Non-numeric host segment degrades to 0, never errors.
        let key = TaskKey::parse("e_s_notanumber_x").unwrap();
        assert_eq!(key.host_id, 0);
    }
}
