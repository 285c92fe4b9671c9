use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Exception;
use crate::object::{Function, Value};
use crate::token::Span;

/// What a task will do when the scheduler first runs it.
#[derive(Debug)]
pub enum TaskKind {
    /// An async function call: the body runs under a fresh frame parented
    /// to the function's defining frame.
    Call {
        function: Rc<Function>,
        arguments: Vec<Value>,
        span: Span,
    },
    /// `run_async(path)`: top-level execution of a script in the spawning
    /// interpreter's global frame.
    Script { path: PathBuf, span: Span },
    /// `sleep(seconds)`: completes once the deadline has passed.
    Timer { deadline: Instant },
}

/// A task yields exactly one outcome; once `Completed` or `Failed` every
/// further await returns the cached result.
#[derive(Debug)]
pub enum TaskState {
    Pending,
    Running,
    Completed(Value),
    Failed(Exception),
}

#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub state: TaskState,
    /// Whether any awaiter has seen the outcome. Failures nobody observed
    /// are reported when the interpreter shuts down.
    pub observed: bool,
}

pub type TaskRef = Rc<RefCell<Task>>;

/// Single-threaded cooperative scheduler: a FIFO ready queue of spawned
/// tasks. Driving (actually evaluating task bodies) lives on the
/// interpreter, which pops from here; the awaiting evaluator frame is the
/// continuation and resumes when driving returns.
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<TaskRef>,
    /// Every spawned non-timer task, for shutdown reporting.
    spawned: Vec<TaskRef>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    pub fn spawn(&mut self, kind: TaskKind) -> TaskRef {
        let task = Rc::new(RefCell::new(Task {
            kind,
            state: TaskState::Pending,
            observed: false,
        }));
        self.ready.push_back(Rc::clone(&task));
        self.spawned.push(Rc::clone(&task));
        task
    }

    /// Timers are not queued; they complete when awaited after their
    /// deadline, and awaiting one pumps the ready queue in the meantime.
    pub fn timer(&mut self, delay: Duration) -> TaskRef {
        Rc::new(RefCell::new(Task {
            kind: TaskKind::Timer {
                deadline: Instant::now() + delay,
            },
            state: TaskState::Pending,
            observed: false,
        }))
    }

    pub fn pop_ready(&mut self) -> Option<TaskRef> {
        self.ready.pop_front()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    /// Failed tasks whose outcome no awaiter ever saw. Called once after
    /// top-level evaluation has finished and the queue has drained.
    pub fn unobserved_failures(&mut self) -> Vec<Exception> {
        let mut failures = Vec::new();
        for task in &self.spawned {
            let mut task = task.borrow_mut();
            if task.observed {
                continue;
            }
            if let TaskState::Failed(error) = &task.state {
                failures.push(error.clone());
                task.observed = true;
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_is_fifo() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.timer(Duration::from_secs(0));
        drop(a);

        let first = scheduler.spawn(TaskKind::Script {
            path: PathBuf::from("a.vlang"),
            span: Span::default(),
        });
        let second = scheduler.spawn(TaskKind::Script {
            path: PathBuf::from("b.vlang"),
            span: Span::default(),
        });

        assert!(Rc::ptr_eq(&scheduler.pop_ready().unwrap(), &first));
        assert!(Rc::ptr_eq(&scheduler.pop_ready().unwrap(), &second));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn timers_are_not_queued() {
        let mut scheduler = Scheduler::new();
        let timer = scheduler.timer(Duration::from_millis(1));

        assert!(scheduler.is_idle());
        assert!(matches!(timer.borrow().state, TaskState::Pending));
    }

    #[test]
    fn unobserved_failures_are_reported_once() {
        let mut scheduler = Scheduler::new();
        let task = scheduler.spawn(TaskKind::Script {
            path: PathBuf::from("x.vlang"),
            span: Span::default(),
        });
        task.borrow_mut().state = TaskState::Failed(Exception::spanless(
            crate::error::ErrorKind::Runtime,
            "boom",
        ));

        assert_eq!(scheduler.unobserved_failures().len(), 1);
        assert_eq!(scheduler.unobserved_failures().len(), 0);
    }
}
