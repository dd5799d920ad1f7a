//! Logging helpers for best-effort code paths.

/// Extension for results whose failure is logged and otherwise dropped.
pub trait ResultOkLogExt<T, E> {
    /// Returns the success value, logging the error at error level
    /// otherwise.
    fn ok_log(self) -> Option<T>;

    /// Same as [`ok_log`](Self::ok_log), prefixing the log line with `msg`.
    fn ok_log_msg(self, msg: &str) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    fn ok_log_msg(self, msg: &str) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{msg}: {err}");
                None
            }
        }
    }
}
