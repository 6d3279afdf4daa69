/// Recommended error type for your session `main` function. Errors from the runner itself are
/// [anyhow::Error]s, so `?` works throughout.
pub type FlameTunnelResult<T> = anyhow::Result<T>;
