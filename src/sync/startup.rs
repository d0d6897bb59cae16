use std::path::Path;

/// Empty the custom feed store before the first synchronization pass.
///
/// The file is created if missing. Called once at startup.
pub fn reset_custom_feed_store(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"")?;
    tracing::info!(path = %path.display(), "Custom feed store reset");
    Ok(())
}
