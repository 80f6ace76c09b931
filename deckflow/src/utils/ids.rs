//! Identifier generation for workflows, threads and checkpoints.

use uuid::Uuid;

/// Generates a workflow id such as `workflow_1a2b3c4d`.
#[must_use]
pub fn generate_workflow_id() -> String {
    format!("workflow_{}", short_hex())
}

/// Generates a thread id such as `thread_1a2b3c4d`.
#[must_use]
pub fn generate_thread_id() -> String {
    format!("thread_{}", short_hex())
}

/// Generates a checkpoint id.
///
/// UUID v7 ids sort by creation time, which keeps file listings and
/// database indexes in append order.
#[must_use]
pub fn generate_checkpoint_id() -> String {
    Uuid::now_v7().to_string()
}

fn short_hex() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ids() {
        let wf = generate_workflow_id();
        let th = generate_thread_id();
        assert!(wf.starts_with("workflow_"));
        assert_eq!(wf.len(), "workflow_".len() + 8);
        assert!(th.starts_with("thread_"));
        assert_ne!(generate_thread_id(), th);
    }

    #[test]
    fn test_checkpoint_ids_are_v7() {
        let id = generate_checkpoint_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }
}
