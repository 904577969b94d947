//! Logger setup shared by the binary and embedding applications.

/// Initialize `env_logger`, defaulting to `info` (or `debug` when `verbose`).
///
/// `RUST_LOG` overrides the default. Calling this more than once is harmless.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_target(verbose)
        .try_init();
}
