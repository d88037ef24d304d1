//! Newline-delimited JSON log files with size-based rotation and gzip
//! archival of rotated files (SPEC_FULL §3 "Log records", §4.I).

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

struct Inner {
    file: File,
    size: u64,
}

pub struct RotatingJsonlWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    inner: Mutex<Inner>,
}

impl RotatingJsonlWriter {
    pub fn new(path: PathBuf, max_bytes: u64, max_files: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            max_files,
            inner: Mutex::new(Inner { file, size }),
        })
    }

    /// Append one JSON line. Rotates (and spawns a background gzip of the
    /// rotated-out file) if this write would exceed `max_bytes`.
    pub async fn append(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut guard = self.inner.lock().await;
        if guard.size > 0 && guard.size + line.len() as u64 > self.max_bytes {
            self.rotate(&mut guard)?;
        }
        guard.file.write_all(&line)?;
        guard.size += line.len() as u64;
        Ok(())
    }

    fn rotate(&self, inner: &mut Inner) -> anyhow::Result<()> {
        inner.file.flush()?;
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let rotated = self.path.with_extension(format!("jsonl.{timestamp}"));
        std::fs::rename(&self.path, &rotated)?;

        let fresh = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.file = fresh;
        inner.size = 0;

        let max_files = self.max_files;
        let dir = self.path.parent().map(Path::to_path_buf);
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned());
        tokio::task::spawn_blocking(move || {
            if let Err(e) = gzip_and_prune(&rotated, dir.as_deref(), stem.as_deref(), max_files) {
                tracing::warn!(error = %e, "log rotation archival failed");
            }
        });
        Ok(())
    }
}

fn gzip_and_prune(
    rotated: &Path,
    dir: Option<&Path>,
    stem: Option<&str>,
    max_files: usize,
) -> anyhow::Result<()> {
    let raw = std::fs::read(rotated)?;
    let gz_path = rotated.with_extension(format!(
        "{}.gz",
        rotated.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default()
    ));
    let gz_file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()?;
    std::fs::remove_file(rotated)?;

    if let (Some(dir), Some(stem)) = (dir, stem) {
        prune_old_archives(dir, stem, max_files)?;
    }
    Ok(())
}

fn prune_old_archives(dir: &Path, stem: &str, max_files: usize) -> anyhow::Result<()> {
    let mut archives: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(stem) && n.ends_with(".gz"))
        })
        .collect();
    archives.sort();
    if archives.len() > max_files {
        for old in &archives[..archives.len() - max_files] {
            let _ = std::fs::remove_file(old);
        }
    }
    Ok(())
}
