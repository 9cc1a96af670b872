use crate::err::TaskError;
use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};

type Job = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// A unit of work queued on a [crate::ThreadPool].
pub(crate) struct Task {
    job: Job,
}

impl Task {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Box::new(move || {
                f();
                Ok(())
            }),
        }
    }

    pub(crate) fn fallible<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        Self {
            job: Box::new(move || f().map_err(|error| error.to_string())),
        }
    }

    /// Run the task, turning a panic or an error return into a [TaskError].
    pub(crate) fn run(self) -> Result<(), TaskError> {
        match catch_unwind(AssertUnwindSafe(self.job)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(TaskError::Failed(message)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

#[cfg(all(test, feature = "std", not(feature = "shuttle"), not(loom)))]
mod tests {
    use crate::err::TaskError;
    use crate::pool::task::Task;
    use test_log::test;

    #[test]
    fn test_run_captures_panics_and_errors() {
        assert_eq!(Task::new(|| {}).run(), Ok(()));
        assert_eq!(
            Task::fallible(|| Err::<(), _>("disk on fire")).run(),
            Err(TaskError::Failed("disk on fire".to_string()))
        );
        assert_eq!(
            Task::new(|| panic!("task {} exploded", 7)).run(),
            Err(TaskError::Panicked("task 7 exploded".to_string()))
        );
        assert_eq!(
            Task::new(|| std::panic::panic_any(42u8)).run(),
            Err(TaskError::Panicked("non-string panic payload".to_string()))
        );
    }
}
