//! A minimal scope guard for multi-exit cleanup paths.

/// [`ExitGuard`] invokes the stored closure when it goes out of scope.
///
/// The rebuild coordinator uses it to release coordination state on every
/// exit path, early returns included.
pub(crate) struct ExitGuard<F: FnOnce()> {
    drop_callback: Option<F>,
}

impl<F: FnOnce()> ExitGuard<F> {
    /// Creates a new [`ExitGuard`] around the supplied closure.
    #[inline]
    pub(crate) fn new(drop_callback: F) -> Self {
        Self {
            drop_callback: Some(drop_callback),
        }
    }
}

impl<F: FnOnce()> Drop for ExitGuard<F> {
    #[inline]
    fn drop(&mut self) {
        if let Some(callback) = self.drop_callback.take() {
            callback();
        }
    }
}
