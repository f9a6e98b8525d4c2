use std::any::Any;
use std::fmt::{self, Display};

/// Trait for errors that may be returned by any of the kubemirror components. This just sets up the
/// trait bounds that are required, since we'll typically only expose rather opaque boxed
/// error types, and they will need to be sent between tasks.
pub trait MirrorError: std::error::Error + Send + Sync + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> MirrorError for T
where
    T: std::error::Error + Send + Sync + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn MirrorError>;

impl dyn MirrorError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: MirrorError>(&self) -> Option<&T> {
        let as_any = self.as_any();
        as_any.downcast_ref::<T>()
    }

    /// convenience function for checking whether the error is of the given concrete type.
    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: MirrorError>(&self) -> bool {
        let as_any = self.as_any();
        as_any.is::<T>()
    }

    /// Returns true if this error only signals that the surrounding task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.is_type::<Cancelled>()
    }
}

impl<T> From<T> for Error
where
    T: MirrorError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

/// Returned by a task that stopped because its cancellation scope was cancelled, rather than
/// because of a failure of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Task was cancelled")
    }
}
impl std::error::Error for Cancelled {}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Boom;
    impl Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("boom")
        }
    }
    impl std::error::Error for Boom {}

    #[test]
    fn boxed_errors_can_be_inspected() {
        let err: Error = Boom.into();
        assert!(err.is_type::<Boom>());
        assert!(!err.is_cancelled());

        let cancelled: Error = Cancelled.into();
        assert!(cancelled.is_cancelled());
        assert_eq!(Some(&Cancelled), cancelled.as_type::<Cancelled>());
    }
}
