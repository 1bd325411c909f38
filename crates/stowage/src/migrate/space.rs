use crate::error::{Result, StowageError};
use std::path::{Path, PathBuf};

/// Share of free space a batch may consume on any one filesystem.
const HEADROOM_FRACTION: f64 = 0.50;

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceInfo {
    pub filesystem_id: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

impl SpaceInfo {
    pub fn writable_budget(&self) -> u64 {
        let budget = (self.free_bytes as f64 * HEADROOM_FRACTION) as u64;
        budget.min(self.available_bytes)
    }
}

/// Bytes a batch will write to one filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceDemand {
    pub root: PathBuf,
    pub info: SpaceInfo,
    pub required_bytes: u64,
}

impl SpaceDemand {
    pub fn check(&self) -> Result<()> {
        let budget = self.info.writable_budget();
        if self.required_bytes > budget {
            log::warn!(
                "Not enough room under {}: {} bytes needed, {} allowed",
                self.root.display(),
                self.required_bytes,
                budget
            );
            return Err(StowageError::InsufficientSpace {
                available: budget,
                required: self.required_bytes,
            });
        }
        Ok(())
    }
}

/// Roots that do not exist yet are measured at their closest existing
/// ancestor.
fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| StowageError::FileNotFound(path.to_path_buf()))
}

pub fn get_free_space<P: AsRef<Path>>(path: P) -> Result<SpaceInfo> {
    let measured = existing_ancestor(path.as_ref())?;

    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(measured.as_os_str().as_bytes()).map_err(|_| {
            StowageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Path contains null byte",
            ))
        })?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(StowageError::Io(std::io::Error::last_os_error()));
        }

        let fragment = stat.f_frsize as u64;
        Ok(SpaceInfo {
            filesystem_id: stat.f_fsid as u64,
            total_bytes: stat.f_blocks as u64 * fragment,
            free_bytes: stat.f_bfree as u64 * fragment,
            available_bytes: stat.f_bavail as u64 * fragment,
        })
    }

    #[cfg(not(unix))]
    {
        Err(StowageError::Config(format!(
            "Free space cannot be measured on this platform ({})",
            measured.display()
        )))
    }
}

/// Folds per-root byte counts into one demand per filesystem, so backup and
/// canonical roots on the same volume are charged together.
pub fn space_demands(roots: &[(&Path, u64)]) -> Result<Vec<SpaceDemand>> {
    let mut demands: Vec<SpaceDemand> = Vec::new();
    for (root, bytes) in roots {
        let info = get_free_space(root)?;
        match demands
            .iter_mut()
            .find(|d| d.info.filesystem_id == info.filesystem_id)
        {
            Some(existing) => existing.required_bytes += bytes,
            None => demands.push(SpaceDemand {
                root: root.to_path_buf(),
                info,
                required_bytes: *bytes,
            }),
        }
    }
    Ok(demands)
}

/// Fails with `InsufficientSpace` if any filesystem would be pushed past its
/// headroom by a batch writing `required_bytes` under each root.
pub fn verify_sufficient_space(roots: &[&Path], required_bytes: u64) -> Result<()> {
    let weighted: Vec<(&Path, u64)> = roots.iter().map(|r| (*r, required_bytes)).collect();
    for demand in space_demands(&weighted)? {
        demand.check()?;
    }
    Ok(())
}
