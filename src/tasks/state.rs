use std::collections::HashMap;

use super::types::TaskStatus;

/// Allowed status edges. Every non-terminal state may jump straight to
/// `terminated`; `running -> running` is the idempotent re-report edge and
/// `terminated -> terminated` the idempotent terminal one. Earlier states
/// deliberately have no self-loop.
pub fn valid_status_transition(src: &TaskStatus, dst: &TaskStatus) -> bool {
    let transition_map: HashMap<TaskStatus, Vec<TaskStatus>> = {
        let mut map = HashMap::new();
        map.insert(
            TaskStatus::Pending,
            vec![TaskStatus::Preparing, TaskStatus::Terminated],
        );
        map.insert(
            TaskStatus::Preparing,
            vec![TaskStatus::Pulling, TaskStatus::Terminated],
        );
        map.insert(
            TaskStatus::Pulling,
            vec![TaskStatus::Creating, TaskStatus::Terminated],
        );
        map.insert(
            TaskStatus::Creating,
            vec![TaskStatus::Running, TaskStatus::Terminated],
        );
        map.insert(
            TaskStatus::Running,
            vec![TaskStatus::Running, TaskStatus::Terminated],
        );
        map.insert(TaskStatus::Terminated, vec![TaskStatus::Terminated]);
        map
    };

    if let Some(valid_states) = transition_map.get(src) {
        valid_states.contains(dst)
    } else {
        false
    }
}
