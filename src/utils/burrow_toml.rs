//! Load `.burrow.toml` from a directory (CLI only). Lib callers inject
//! [`Settings`](crate::Settings) directly.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::Settings;
use crate::utils::config::PackagePaths;

#[derive(Debug, Deserialize)]
pub(crate) struct BurrowToml {
    #[serde(default)]
    settings: SettingsSection,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    catalog: Option<String>,
    storage: Option<Vec<String>>,
    hashers: Option<usize>,
    uploaders: Option<usize>,
    min_blob_size: Option<u64>,
    min_blob_count: Option<usize>,
    padding_min_bytes: Option<u64>,
    padding_max_bytes: Option<u64>,
    padding_min_percent: Option<f64>,
    padding_max_percent: Option<f64>,
    no_compression_exts: Option<Vec<String>>,
    exclude_prefixes: Option<Vec<String>>,
    exclude_suffixes: Option<Vec<String>>,
    skip_hash_failures: Option<bool>,
    status_interval: Option<i64>,
}

/// Load the config file from `dir` if present. Returns None if the file is
/// missing or unreadable. CLI only.
pub(crate) fn load_burrow_toml(dir: &Path) -> Option<BurrowToml> {
    let path = dir.join(PackagePaths::get().config_filename());
    let s = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

/// Overwrite a settings field from the file when present.
macro_rules! apply_file_opt {
    ($sec:expr, $settings:expr, $file_field:ident => $settings_field:ident) => {
        if let Some(v) = $sec.$file_field {
            $settings.$settings_field = v;
        }
    };
}

/// Apply file config to settings and paths (only fields present in the file).
/// Call before applying CLI flags so the CLI wins.
pub(crate) fn apply_file_to_settings(
    file: &BurrowToml,
    settings: &mut Settings,
    catalog: &mut Option<PathBuf>,
    storage: &mut Vec<PathBuf>,
) {
    let sec = &file.settings;
    if let Some(ref p) = sec.catalog
        && catalog.is_none()
    {
        *catalog = Some(PathBuf::from(p));
    }
    if let Some(ref dirs) = sec.storage
        && storage.is_empty()
    {
        storage.extend(dirs.iter().map(PathBuf::from));
    }
    apply_file_opt!(sec, settings, hashers => num_hasher_threads);
    apply_file_opt!(sec, settings, uploaders => num_uploader_threads);
    apply_file_opt!(sec, settings, min_blob_size => min_blob_size);
    apply_file_opt!(sec, settings, min_blob_count => min_blob_count);
    apply_file_opt!(sec, settings, padding_min_bytes => padding_min_bytes);
    apply_file_opt!(sec, settings, padding_max_bytes => padding_max_bytes);
    apply_file_opt!(sec, settings, padding_min_percent => padding_min_percent);
    apply_file_opt!(sec, settings, padding_max_percent => padding_max_percent);
    if let Some(ref v) = sec.no_compression_exts {
        settings.no_compression_exts = v.clone();
    }
    if let Some(ref v) = sec.exclude_prefixes {
        settings.exclude_prefixes = v.clone();
    }
    if let Some(ref v) = sec.exclude_suffixes {
        settings.exclude_suffixes = v.clone();
    }
    apply_file_opt!(sec, settings, skip_hash_failures => skip_hash_failures);
    apply_file_opt!(sec, settings, status_interval => upload_status_interval_seconds);
}
