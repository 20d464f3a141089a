#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(not(test))]
macro_rules! test_trace {
    ($($t:tt)*) => {};
}

#[cfg(test)]
macro_rules! test_trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

/// Reports a fatal policy fault with a formatted message.
///
/// This is shorthand for calling [`ErrorReporter::report_fatal`] with
/// [`format_args!`], and evaluates to `true` if this was the first fault
/// reported.
///
/// ```
/// use mycosched::{fatal, Config, DetachedHost, Runtime};
///
/// let rt = Runtime::load(Config::new(4), DetachedHost::new()).unwrap();
/// assert!(fatal!(rt.reporter(), "corrupt queue {}", 5));
/// assert!(!rt.is_enabled());
/// ```
///
/// [`ErrorReporter::report_fatal`]: crate::ErrorReporter::report_fatal
#[macro_export]
macro_rules! fatal {
    ($reporter:expr, $($arg:tt)+) => {
        $crate::ErrorReporter::report_fatal(&$reporter, format_args!($($arg)+))
    };
}

#[cfg(test)]
pub(crate) fn trace_init() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_target(false).without_time())
        .with(filter)
        .set_default()
}
