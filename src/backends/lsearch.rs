//! Linear search of a flat text file.
//!
//! The file holds `key: value` records, one per line. Blank lines and
//! lines starting with `#` are skipped; lines starting with whitespace
//! continue the previous record's value.

use std::{
    any::Any,
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
};

use anyhow::{bail, Result};
use displaydoc::Display;
use thiserror::Error;

use crate::driver::{DriverHandle, FileChecks, FindOutcome, LookupDriver};

/// [`LsearchErrorKind`] describes the errors the flat-file driver can
/// return
#[derive(Error, Debug, Display)]
pub enum LsearchErrorKind {
    /// lsearch needs a filename
    MissingFilename,
    /// opening file failed: `{0:?}`
    OpeningFileFailed(std::io::Error),
    /// file mode {mode:o} has forbidden bits {forbidden:o} set
    ModeNotPermitted {
        /// Observed permission bits
        mode: u32,
        /// Bits the caller forbids
        forbidden: u32,
    },
    /// file owner uid {0} is not in the allowed owners
    OwnerNotPermitted(u32),
    /// file group gid {0} is not in the allowed groups
    GroupNotPermitted(u32),
}

/// Flat-file linear-search driver.
pub struct LsearchDriver;

struct OpenFile {
    file: File,
}

impl LookupDriver for LsearchDriver {
    fn open(&self, filename: Option<&str>) -> Result<DriverHandle> {
        let filename = filename.ok_or(LsearchErrorKind::MissingFilename)?;
        let file = File::open(filename).map_err(LsearchErrorKind::OpeningFileFailed)?;
        Ok(Box::new(OpenFile { file }))
    }

    fn check(
        &self,
        handle: &mut dyn Any,
        _filename: Option<&str>,
        checks: &FileChecks,
    ) -> Result<()> {
        let Some(open) = handle.downcast_mut::<OpenFile>() else {
            bail!("not an lsearch handle");
        };
        check_open_file(&open.file, checks)
    }

    fn find(
        &self,
        handle: &mut dyn Any,
        _filename: Option<&str>,
        key: &str,
        _opts: Option<&str>,
    ) -> FindOutcome {
        let Some(open) = handle.downcast_mut::<OpenFile>() else {
            return FindOutcome::defer("not an lsearch handle");
        };
        match search_file(&mut open.file, key) {
            Ok(Some(data)) => FindOutcome::hit(data),
            Ok(None) => FindOutcome::miss(),
            Err(err) => FindOutcome::defer(err.to_string()),
        }
    }

    fn close(&self, handle: DriverHandle) {
        drop(handle);
    }
}

/// Verify mode, owner and group on the already-open descriptor. Checking
/// the path first would race with a rename.
#[cfg(unix)]
fn check_open_file(file: &File, checks: &FileChecks) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let st = nix::sys::stat::fstat(file.as_raw_fd())?;
    let mode = u32::from(st.st_mode) & 0o7777;
    if mode & checks.forbid_mode != 0 {
        return Err(LsearchErrorKind::ModeNotPermitted {
            mode,
            forbidden: checks.forbid_mode,
        }
        .into());
    }
    let uid = st.st_uid;
    if !checks.owners.is_empty() && !checks.owners.contains(&uid) {
        return Err(LsearchErrorKind::OwnerNotPermitted(uid).into());
    }
    let gid = st.st_gid;
    if !checks.groups.is_empty() && !checks.groups.contains(&gid) {
        return Err(LsearchErrorKind::GroupNotPermitted(gid).into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_open_file(_file: &File, _checks: &FileChecks) -> Result<()> {
    Ok(())
}

fn search_file(file: &mut File, key: &str) -> std::io::Result<Option<String>> {
    let _ = file.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(&mut *file);
    let mut value: Option<String> = None;

    for line in reader.lines() {
        let line = line?;

        if let Some(value) = &mut value {
            // Collect continuation lines of the matched record, then stop.
            if line.starts_with([' ', '\t']) {
                value.push('\n');
                value.push_str(line.trim_start());
                continue;
            }
            break;
        }

        if line.is_empty() || line.starts_with('#') || line.starts_with([' ', '\t']) {
            continue;
        }
        let (candidate, rest) = match line.split_once(':') {
            Some((candidate, rest)) => (candidate.trim_end(), rest),
            None => (line.trim_end(), ""),
        };
        if candidate == key {
            value = Some(rest.trim_start().to_string());
        }
    }

    Ok(value)
}
