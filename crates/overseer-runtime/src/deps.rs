//! Dependency evaluation over the managed-task table.
//!
//! Reverse edges (`dependents`) are recorded lazily as dependencies are
//! inspected; re-evaluation is idempotent while any dependency is pending.

use std::collections::HashMap;

use overseer_core::models::{TaskId, TaskState};

use crate::task::ManagedTask;

/// Outcome of a dependency check for a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DepCheck {
    /// All dependencies completed; the task may be enqueued.
    Satisfied,
    /// At least one dependency has not reached a decisive state yet.
    Pending,
    /// A dependency failed or was cancelled and the task is configured to
    /// cancel on dependency failure.
    Failed { dependency: TaskId },
    /// A dependency id does not resolve to a known task.
    Missing { dependency: TaskId },
}

/// Evaluates `id`'s dependencies, recording `id` as a dependent of each
/// dependency it inspects. Stops at the first decisive dependency, mirroring
/// the fact that later edges are (re)recorded on the next evaluation.
pub(crate) fn evaluate(tasks: &mut HashMap<TaskId, ManagedTask>, id: &TaskId) -> DepCheck {
    let (dependencies, cancel_on_failure) = match tasks.get(id) {
        Some(task) => (
            task.config.dependencies.clone(),
            task.config.cancel_on_dependency_failure,
        ),
        None => return DepCheck::Pending,
    };

    for dep_id in dependencies {
        match tasks.get_mut(&dep_id) {
            None => return DepCheck::Missing { dependency: dep_id },
            Some(dep) => {
                dep.dependents.insert(id.clone());
                match dep.state {
                    TaskState::Completed => {}
                    TaskState::Failed | TaskState::Cancelled if cancel_on_failure => {
                        return DepCheck::Failed { dependency: dep_id };
                    }
                    _ => return DepCheck::Pending,
                }
            }
        }
    }

    DepCheck::Satisfied
}
