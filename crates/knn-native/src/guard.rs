//! Unwind boundary for native entry points.
//!
//! Every [`NativeLibrary`](crate::NativeLibrary) call runs inside [`guarded`]:
//! a panic is caught and turned into [`NativeError::Panicked`], and any error
//! is also recorded as the thread's last error message so callers that only
//! get a status can ask for details.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::NativeError;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

/// Last error recorded on this thread by a guarded call, if any.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Runs `f`, converting a panic into an error instead of unwinding further.
pub fn guarded<T, F>(operation: &'static str, f: F) -> Result<T, NativeError>
where
    F: FnOnce() -> Result<T, NativeError>,
{
    let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(NativeError::Panicked {
            operation,
            message: panic_message(payload.as_ref()),
        })
    });
    if let Err(e) = &result {
        set_last_error(e.to_string());
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_becomes_error() {
        clear_last_error();
        let result: Result<(), _> = guarded("explode", || panic!("boom"));
        assert_eq!(
            result,
            Err(NativeError::Panicked {
                operation: "explode",
                message: "boom".to_string()
            })
        );
        assert_eq!(last_error().as_deref(), Some("explode panicked: boom"));
    }

    #[test]
    fn formatted_panic_message_is_kept() {
        let result: Result<(), _> = guarded("index", || panic!("slot {} out of range", 7));
        match result {
            Err(NativeError::Panicked { message, .. }) => assert_eq!(message, "slot 7 out of range"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_leaves_last_error_alone() {
        clear_last_error();
        assert_eq!(guarded("ok", || Ok(5)), Ok(5));
        assert_eq!(last_error(), None);
    }

    #[test]
    fn plain_errors_are_recorded() {
        clear_last_error();
        let _ = guarded::<(), _>("train", || Err(NativeError::Training("no data".into())));
        assert_eq!(last_error().as_deref(), Some("training failed: no data"));
    }
}
