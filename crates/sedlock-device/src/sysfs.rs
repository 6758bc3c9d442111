//! Block device discovery from a sysfs-style directory tree.

use log::debug;
use regex::Regex;
use sedlock_core::error::SedResult;
use sedlock_core::transport::Drive;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// List `<root>/<name>` entries whose name matches `pattern`, sorted by name.
///
/// A missing root simply means no drives are attached.
pub(crate) fn scan_block_devices(root: &Path, pattern: &Regex) -> SedResult<Vec<Drive>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("{} does not exist; no drives", root.display());
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut drives = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !pattern.is_match(&name) {
            continue;
        }
        let device_dir = entry.path().join("device");
        drives.push(Drive {
            path: device_node(&name),
            name: display_name(&device_dir),
        });
    }
    drives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(drives)
}

pub(crate) fn device_node(name: &str) -> PathBuf {
    Path::new("/dev").join(name)
}

/// `vendor model` as reported by the kernel, or empty when neither is readable.
fn display_name(device_dir: &Path) -> String {
    [read_attr(device_dir, "vendor"), read_attr(device_dir, "model")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(attr)).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
