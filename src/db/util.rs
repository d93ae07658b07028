//! Helpers for treating "no rows" as a non-error.

use crate::error::{DbError, DbResult};

/// Swallow [`DbError::NotFound`]; wrap anything else with `message`.
pub fn empty_or_error(err: DbError, message: &str) -> DbResult<()> {
    if err.is_not_found() {
        return Ok(());
    }
    Err(err.context(message))
}

/// Turns a "no rows" failure into `Ok(None)`.
pub trait OptionalExt<T> {
    fn optional(self, message: &str) -> DbResult<Option<T>>;
}

impl<T> OptionalExt<T> for DbResult<T> {
    fn optional(self, message: &str) -> DbResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) => empty_or_error(err, message).map(|()| None),
        }
    }
}
