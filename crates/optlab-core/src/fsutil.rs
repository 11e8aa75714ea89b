use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Writes `bytes` to `path` so that readers only ever see the old file or the
/// complete new one.
///
/// The data goes to a freshly created sibling temp file (same directory, so
/// the same filesystem), is synced, and then renamed over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let written = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!(
            "optlab_fsutil_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp_files() {
        let root = temp_root("atomic");
        let path = root.join("state.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"second");

        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_creates_missing_parent() {
        let root = temp_root("parent");
        let path = root.join("nested").join("deeper").join("file.txt");
        atomic_write_bytes(&path, b"x").expect("write");
        assert!(path.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_line_only_grows_the_file() {
        let root = temp_root("append");
        let path = root.join("trace.csv");
        append_line(&path, "a,1").expect("append a");
        append_line(&path, "b,2\n").expect("append b");
        assert_eq!(fs::read_to_string(&path).expect("read"), "a,1\nb,2\n");
        let _ = fs::remove_dir_all(root);
    }
}
