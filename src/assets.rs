use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
pub struct AssetSummary {
    pub config_files: usize,
    pub save_files: usize,
}

pub fn scan(root: &Path) -> Result<AssetSummary, String> {
    Ok(AssetSummary {
        config_files: count_dir(root.join("config"))?,
        save_files: count_dir_optional(root.join("save")),
    })
}

fn count_dir(path: impl AsRef<Path>) -> Result<usize, String> {
    let path = path.as_ref();
    let entries = fs::read_dir(path)
        .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;

    let mut count = 0usize;
    for entry in entries {
        if entry.is_ok() {
            count += 1;
        }
    }

    Ok(count)
}

/// The save directory appears on first ban write; absence is fine.
fn count_dir_optional(path: impl AsRef<Path>) -> usize {
    count_dir(path).unwrap_or(0)
}
