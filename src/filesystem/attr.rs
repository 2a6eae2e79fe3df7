//! Conversion of mirror `stat` results into the host's attribute
//! record, and the write-bit masking that keeps scripts read-only.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_mt::{FileAttr, FileType};
use nix::sys::stat::FileStat;

/// Validity window reported to the host for attributes and entries.
pub const TTL: Duration = Duration::from_secs(1);

const WRITE_BITS: u32 = 0o222;

pub fn file_type(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub fn is_regular(st: &FileStat) -> bool {
    (st.st_mode & libc::S_IFMT) == libc::S_IFREG
}

pub fn has_write_bits(mode: u32) -> bool {
    mode & WRITE_BITS != 0
}

pub fn clear_write_bits(mode: u32) -> u32 {
    mode & !WRITE_BITS
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

pub fn to_file_attr(st: &FileStat) -> FileAttr {
    FileAttr {
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        flags: 0,
    }
}

/// Strip the write bits from a reported attribute; scripts are
/// read-only in this view.
pub fn mask_script_attr(attr: &mut FileAttr) {
    attr.perm &= !(WRITE_BITS as u16);
}
