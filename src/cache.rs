use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::HprofRetainError;

const DIR_EXT: &str = ".rcache";
const AUX_FILE: &str = "hprof-retain.aux";
const DIRTY_FILENAME: &str = "dirty.lck";

/// Home of every artifact produced by an analysis: the mapped object table,
/// the reference-list data file, spilled stream buffers and the persisted
/// analysis header.
///
/// A temporary cache directory keeps nothing across runs; artifacts land in
/// the system temp directory and the owner is expected to delete them. A
/// persistent one lives next to the snapshot and carries a `dirty.lck`
/// sentinel while its contents are being mutated, so a later run can detect
/// an unclean shutdown and rebuild instead of trusting stale state.
#[derive(Clone, Debug)]
pub struct CacheDirectory {
    dir: Option<PathBuf>,
}

impl CacheDirectory {
    pub fn persistent(dir: &Path) -> Result<CacheDirectory, HprofRetainError> {
        fs::create_dir_all(dir)?;
        Ok(CacheDirectory {
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn temporary() -> CacheDirectory {
        CacheDirectory { dir: None }
    }

    /// Default persistent cache location for a snapshot: a sibling directory
    /// named after the snapshot file.
    pub fn for_snapshot(snapshot: &Path) -> Result<CacheDirectory, HprofRetainError> {
        let name = snapshot
            .file_name()
            .ok_or_else(|| HprofRetainError::InputFileNotFound {
                name: snapshot.display().to_string(),
            })?;
        let mut dir_name = name.to_os_string();
        dir_name.push(DIR_EXT);
        let dir = snapshot.parent().unwrap_or_else(|| Path::new(".")).join(dir_name);
        CacheDirectory::persistent(&dir)
    }

    pub fn is_temporary(&self) -> bool {
        self.dir.is_none()
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn create_temp_file(&self, prefix: &str, suffix: &str) -> Result<PathBuf, HprofRetainError> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir(),
        };
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)?;
        let (_, path) = file
            .keep()
            .map_err(|e| HprofRetainError::StdIoError { e: e.error })?;
        Ok(path)
    }

    /// Resolves a previously persisted file by the name recorded in the
    /// analysis header. Absolute paths are honoured if they still exist,
    /// otherwise the file is looked up inside the cache directory.
    pub fn cache_file(&self, name: &str) -> Result<PathBuf, HprofRetainError> {
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Ok(direct);
        }
        if let (Some(dir), Some(file_name)) = (&self.dir, direct.file_name()) {
            let local = dir.join(file_name);
            if local.is_file() {
                return Ok(local);
            }
        }
        Err(HprofRetainError::StdIoError {
            e: io::Error::new(io::ErrorKind::NotFound, name.to_string()),
        })
    }

    pub fn aux_file(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(AUX_FILE))
    }

    pub fn is_dirty(&self) -> bool {
        match &self.dir {
            Some(dir) => dir.join(DIRTY_FILENAME).is_file(),
            None => true,
        }
    }

    pub fn set_dirty(&self, dirty: bool) -> Result<(), HprofRetainError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let dirty_file = dir.join(DIRTY_FILENAME);
        if dirty {
            fs::File::create(dirty_file)?;
        } else if dirty_file.is_file() {
            fs::remove_file(dirty_file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_marker_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDirectory::persistent(tmp.path()).unwrap();
        assert!(!cache.is_dirty());
        cache.set_dirty(true).unwrap();
        assert!(cache.is_dirty());
        cache.set_dirty(false).unwrap();
        assert!(!cache.is_dirty());
    }

    #[test]
    fn temporary_cache_is_always_dirty() {
        let cache = CacheDirectory::temporary();
        assert!(cache.is_temporary());
        assert!(cache.is_dirty());
        // no sentinel to maintain
        cache.set_dirty(true).unwrap();
        cache.set_dirty(false).unwrap();
    }

    #[test]
    fn temp_files_land_in_the_cache_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDirectory::persistent(tmp.path()).unwrap();
        let path = cache.create_temp_file("retain", ".gc").unwrap();
        assert!(path.starts_with(tmp.path()));
        assert!(path.is_file());
    }

    #[test]
    fn cache_file_resolves_by_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDirectory::persistent(tmp.path()).unwrap();
        let path = cache.create_temp_file("retain", ".ref").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let resolved = cache.cache_file(name).unwrap();
        assert_eq!(resolved, tmp.path().join(name));
        assert!(cache.cache_file("missing.ref").is_err());
    }
}
