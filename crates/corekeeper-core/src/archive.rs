//! Unpacking downloaded archives and locating the binary inside.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::release::ArchiveKind;

/// How deep [`locate_binary`] descends below the unpack root.
const MAX_SEARCH_DEPTH: usize = 4;

/// Extract `archive` into `dest`, which is created if needed.
///
/// Tarballs are decoded on a blocking thread; entries that would land
/// outside `dest` are refused by the tar reader. Zip archives go through
/// the host `unzip` tool.
pub async fn unpack(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| corekeeper_store::StoreError::from_write(dest, e))?;

    match kind {
        ArchiveKind::TarGz => {
            let archive = archive.to_path_buf();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &dest)).await??;
        }
        ArchiveKind::Zip => unpack_zip(archive, dest).await?,
    }
    debug!(archive = ?archive, dest = ?dest, "archive unpacked");
    Ok(())
}

fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let fail = |message: String| CoreError::Archive {
        path: archive.to_path_buf(),
        message,
    };
    let file = std::fs::File::open(archive)
        .map_err(|e| corekeeper_store::StoreError::from_io(archive, e))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball.set_overwrite(true);
    tarball.unpack(dest).map_err(|e| fail(e.to_string()))
}

async fn unpack_zip(archive: &Path, dest: &Path) -> Result<()> {
    let fail = |message: String| CoreError::Archive {
        path: archive.to_path_buf(),
        message,
    };
    let output = tokio::process::Command::new("unzip")
        .arg("-q")
        .arg("-o")
        .arg(archive)
        .arg("-d")
        .arg(dest)
        .output()
        .await
        .map_err(|e| fail(format!("unzip could not be launched: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fail(format!("unzip failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Find the first regular file under `root` named like one of `candidates`.
/// Earlier candidates win; within one candidate the shallowest match wins.
pub fn locate_binary(root: &Path, candidates: &[String]) -> Option<PathBuf> {
    let mut files = Vec::new();
    collect_files(root, 0, &mut files);
    files.sort_by_key(|(depth, path)| (*depth, path.clone()));

    candidates.iter().find_map(|name| {
        files
            .iter()
            .find(|(_, path)| path.file_name().is_some_and(|f| f == name.as_str()))
            .map(|(_, path)| path.clone())
    })
}

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<(usize, PathBuf)>) {
    if depth > MAX_SEARCH_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_files(&entry.path(), depth + 1, out);
        } else if file_type.is_file() {
            out.push((depth, entry.path()));
        }
    }
}
