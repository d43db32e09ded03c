use std::io;
use std::path::Path;

/// Directory holding `path`, with a bare file name resolving to the working directory.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Flushes directory metadata, making a completed rename durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    tracing::trace!("Running fsync() on {}", dir.display());
    let dir = std::fs::File::open(dir)?;
    rustix::fs::fsync(&dir)?;
    Ok(())
}

/// Formats a byte count for log lines.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
