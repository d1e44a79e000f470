use anyhow::Result;
use std::path::Path;

use crate::prepare::PrepareConfig;

pub fn check_buffer_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        anyhow::ensure!(dir.is_dir(), "buffer.dir is not a dir: {}", dir.display());
        let marker = dir.join(".doctor_write_check");
        std::fs::write(&marker, b"ok").map_err(|e| anyhow::anyhow!("buffer.dir not writable ({}): {}", dir.display(), e))?;
        std::fs::remove_file(&marker).ok();
    }
    Ok(())
}

pub fn check_layout(cfg: &PrepareConfig) -> Result<()> {
    anyhow::ensure!(cfg.manifest.is_file(), "prepare.manifest not found: {}", cfg.manifest.display());
    for dir in [Some(&cfg.left_dir), Some(&cfg.right_dir), cfg.mask_dir.as_ref()].into_iter().flatten() {
        anyhow::ensure!(dir.is_dir(), "prepare dir not found: {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_dir_must_be_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        check_buffer_dir(&tmp.path().join("not-yet")).unwrap();
        check_buffer_dir(tmp.path()).unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(check_buffer_dir(&file).is_err());
    }
}
