/// Helper macro for locking items
///
/// Maps a poisoned lock to [`crate::Error::LockError`] instead of panicking, so it must be used
/// in a function returning [`crate::Result`].
///
/// ```rust, ignore
///  let mut state = lock!(self.state);
///  state.sequence += 1;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}
