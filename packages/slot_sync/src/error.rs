use thiserror::Error;

/// Errors that can occur when operating on the primitives in this crate.
///
/// Contention and conditional mismatches are never errors - those are reported through the
/// return values of the individual operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The destination of a bulk copy could not hold every occupied value of the bucket.
    #[error(
        "destination is too small: {required} values need to be copied but only {available} positions are available"
    )]
    TargetTooSmall {
        /// How many positions the copy needed, as far as it could tell when it gave up.
        ///
        /// The bucket may be mutated concurrently, so this is a lower bound.
        required: usize,

        /// How many positions were available after the requested offset.
        available: usize,
    },
}

/// A specialized `Result` type for operations in this crate, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn target_too_small_mentions_both_sizes() {
        let error = Error::TargetTooSmall {
            required: 5,
            available: 3,
        };

        let message = error.to_string();
        assert!(message.contains('5'));
        assert!(message.contains('3'));
    }
}
