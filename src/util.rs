use std::fs::File;
use std::io::Write;

use camino::Utf8Path;
use rand::prelude::*;

use crate::Result;

pub fn tmp_file_name() -> String {
    const ALPHANUM_CHARS: [char; 52] = [
        'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
        'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j',
        'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    ];

    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .filter_map(|_| ALPHANUM_CHARS.choose(&mut rng))
        .collect();

    format!("tmp_obj_{suffix}")
}

/// Make a rename or unlink inside `dir` durable.
pub fn sync_dir(dir: &Utf8Path) -> Result<()> {
    // Directories cannot be opened for syncing on windows; the rename is as durable as it gets.
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Write `bytes` to a fresh temporary file next to `path`, then rename it into place.
///
/// Readers see either the old file or the complete new one, never a partial write.
pub fn write_atomic(path: &Utf8Path, bytes: &[u8], fsync: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let temp_path = dir.join(tmp_file_name());

    let mut file = File::create(&temp_path)?;
    let written = file.write_all(bytes).and_then(|_| {
        if fsync {
            file.sync_all()
        } else {
            Ok(())
        }
    });
    drop(file);

    if let Err(e) = written.and_then(|_| std::fs::rename(&temp_path, path)) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if fsync {
        sync_dir(dir)?;
    }
    Ok(())
}
