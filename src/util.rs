/// Abort the process with a diagnostic.
///
/// Used for contract violations: a broken scheduler invariant means another
/// fiber's stack may already be corrupt, so unwinding (which the fiber entry
/// trampoline catches) is not an option.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("fatal: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}
