use crate::download::dedup::{hard_link_replacing, DedupRegistry, LinkOutcome};
use crate::output::GlobalStats;
use crate::UpdateError;
use std::path::Path;
use std::sync::atomic::Ordering;

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// What the startup scan did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Files registered as already downloaded
    pub registered: u64,
    /// Same-named duplicates replaced by hard links
    pub linked: u64,
    /// Leftover partial downloads removed
    pub removed_partials: u64,
}

/// Registers every file under `<root>/<source>/` with the dedup registry
///
/// - creates `root` if it does not exist
/// - removes leftover `.part` files from interrupted downloads
/// - hard-links files whose name was already registered from another source
///   directory, counting the saved bytes
///
/// Directories are visited in name order so the first registration is
/// deterministic. Blocking; call from a blocking context.
pub fn scan_existing(
    root: &Path,
    registry: &DedupRegistry,
    stats: &GlobalStats,
) -> Result<ScanSummary, UpdateError> {
    std::fs::create_dir_all(root).map_err(|e| UpdateError::filesystem(root, e))?;

    let mut summary = ScanSummary::default();

    for source_dir in sorted_entries(root)? {
        if !source_dir.is_dir() {
            continue;
        }

        for path in sorted_entries(&source_dir)? {
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(PARTIAL_SUFFIX) {
                tracing::debug!("Removing partial download {}", path.display());
                std::fs::remove_file(&path).map_err(|e| UpdateError::filesystem(&path, e))?;
                summary.removed_partials += 1;
                continue;
            }

            match registry.register_existing(name, &path) {
                None => summary.registered += 1,
                Some(existing) => {
                    if let LinkOutcome::Linked { bytes } = hard_link_replacing(&existing, &path)? {
                        stats.linked.fetch_add(1, Ordering::Relaxed);
                        stats.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
                        summary.linked += 1;
                    }
                }
            }
        }
    }

    tracing::info!(
        "Startup scan: {} files registered, {} duplicates linked, {} partial files removed",
        summary.registered,
        summary.linked,
        summary.removed_partials
    );

    Ok(summary)
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::path::PathBuf>, UpdateError> {
    let mut paths = std::fs::read_dir(dir)
        .map_err(|e| UpdateError::filesystem(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UpdateError::filesystem(dir, e))?;
    paths.sort();
    Ok(paths)
}
