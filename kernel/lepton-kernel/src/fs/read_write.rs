//! File-operation dispatch: the generic half of read/write/seek/ioctl.
//!
//! Access-mode checks, position bookkeeping, `O_APPEND` pinning and the
//! couple of generic ioctls live here; everything else forwards to the
//! open file's [`FileOps`](super::FileOps).

use alloc::sync::Arc;

use lepton_syscall::flags::{OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET};
use lepton_syscall::ioctl::FIONBIO;
use lepton_syscall::{Errno, KResult};

use crate::kernel::Kernel;

use super::{DirEntry, File};

/// Reads at the file position, advancing it.
pub fn read(k: &Kernel, file: &Arc<File>, buf: &mut [u8]) -> KResult<usize> {
    if !file.readable() {
        return Err(Errno::EBADF);
    }
    // A zero-byte read succeeds without consulting the inode.
    if buf.is_empty() {
        return Ok(0);
    }
    let pos = file.pos();
    let n = file.fops.read(k, file, buf, pos)?;
    file.set_pos(pos + n as i64);
    Ok(n)
}

/// Writes at the file position (or at EOF under `O_APPEND`), advancing it.
pub fn write(k: &Kernel, file: &Arc<File>, buf: &[u8]) -> KResult<usize> {
    if !file.writable() {
        return Err(Errno::EBADF);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    let pos = if file.flags().contains(OpenFlags::APPEND) {
        // Pin to end-of-file so concurrent appenders cannot tear.
        file.inode.size()
    } else {
        file.pos()
    };
    let n = file.fops.write(k, file, buf, pos)?;
    file.set_pos(pos + n as i64);
    Ok(n)
}

/// Positional read; the file position is untouched.
pub fn pread(k: &Kernel, file: &Arc<File>, buf: &mut [u8], pos: i64) -> KResult<usize> {
    if !file.readable() {
        return Err(Errno::EBADF);
    }
    if pos < 0 {
        return Err(Errno::EINVAL);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    file.fops.read(k, file, buf, pos)
}

/// `lseek`: computes the target, lets the file ops veto it, moves.
pub fn lseek(k: &Kernel, file: &Arc<File>, offset: i64, whence: u32) -> KResult<i64> {
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => file.pos(),
        SEEK_END => file.inode.size(),
        _ => return Err(Errno::EINVAL),
    };
    let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
    if target < 0 {
        return Err(Errno::EINVAL);
    }
    let accepted = file.fops.lseek(k, file, target)?;
    file.set_pos(accepted);
    Ok(accepted)
}

/// Returns the next directory entry, advancing the position.
pub fn readdir(k: &Kernel, file: &Arc<File>) -> KResult<Option<DirEntry>> {
    if !file.inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let index = file.pos() as usize;
    let entry = file.fops.readdir(k, file, index)?;
    if entry.is_some() {
        file.set_pos(index as i64 + 1);
    }
    Ok(entry)
}

/// ioctl dispatch: generic requests here, the rest to the driver.
pub fn ioctl(k: &Kernel, file: &Arc<File>, cmd: u32, arg: usize) -> KResult<usize> {
    match cmd {
        FIONBIO => {
            // arg points at an int in user memory; the syscall layer
            // has already fetched it.
            if arg != 0 {
                file.set_status_flags(file.flags() | OpenFlags::NONBLOCK);
            } else {
                file.set_status_flags(file.flags() - OpenFlags::NONBLOCK);
            }
            Ok(0)
        }
        _ => file.fops.ioctl(k, file, cmd, arg),
    }
}
