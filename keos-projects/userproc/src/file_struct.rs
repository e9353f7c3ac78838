//! # File state of a process.
//!
//! Every process carries its own view of the filesystem: a current working
//! directory and a table mapping small integers (file descriptors) to open
//! file objects. This module implements that state, [`FileStruct`], along
//! with the system call handlers that operate on it — `open`, `read`,
//! `write`, `seek`, `tell`, `close`, `create`, `remove` and `filesize`.
//!
//! ## File descriptor table
//!
//! Unlike a growable map, [`FileStruct`] backs its descriptor table with a
//! fixed-size array of [`FD_MAX`] slots. Descriptors 0 and 1 are permanently
//! reserved for stdin/stdout; [`FileStruct::install_file`] hands out the
//! lowest free slot starting at 2. A descriptor outside `0..FD_MAX` is never
//! valid and is rejected without touching the array.
//!
//! ## Deny-write on executables
//!
//! A [`RegularFile`] that backs a running executable's text must not be
//! written to while any process still maps it. [`mark_deny_write`] and
//! [`unmark_deny_write`] maintain a system-wide refcount per inode; `write`
//! consults [`is_write_denied`] before touching the underlying file.
//!
//! ## User memory access
//!
//! As in the rest of the syscall surface, arguments that name user buffers
//! or strings are only ever touched through [`keos::syscall::uaccess`]'s
//! validated pointer types — never through raw pointers.

use crate::syscall::SyscallAbi;
use alloc::collections::BTreeMap;
use keos::{
    KernelError,
    fs::{Directory, File as FsFile, InodeNumber, RegularFile},
    sync::SpinLock,
    syscall::{
        flags::FileMode,
        uaccess::{UserCString, UserU8SliceRO, UserU8SliceWO},
    },
    teletype::{Teletype, serial},
};

/// The maximum number of file descriptors a single process may hold,
/// including the two reserved for stdio.
pub const FD_MAX: usize = 128;

/// `whence` value for [`FileStruct::seek`]: offset is relative to the start
/// of the file.
const SEEK_SET: usize = 0;
/// `whence` value for [`FileStruct::seek`]: offset is relative to the
/// current position.
const SEEK_CUR: usize = 1;
/// `whence` value for [`FileStruct::seek`]: offset is relative to the end of
/// the file.
const SEEK_END: usize = 2;

/// The type of a file referenced by a process's descriptor table.
#[derive(Clone)]
pub enum FileKind {
    /// A regular file on the filesystem.
    RegularFile {
        /// The underlying kernel file object.
        file: RegularFile,
        /// Current offset, in bytes from the start of the file.
        position: usize,
    },
    /// A directory of the filesystem.
    Directory {
        dir: Directory,
        /// Offset used by directory-entry iteration.
        position: usize,
    },
    /// Standard input/output streams; not backed by a filesystem object.
    Stdio,
}

/// A single entry of a process's file descriptor table.
#[derive(Clone)]
pub struct File {
    /// The access mode the file was opened with.
    pub mode: FileMode,
    /// The kernel-side file object this descriptor refers to.
    pub file: FileKind,
}

/// An index into a process's file descriptor table.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

/// System-wide refcount of how many open descriptors currently deny writes
/// to a given inode. An executable's backing file is marked while it is
/// mapped as a running program's text/data and unmarked when the last such
/// mapping goes away.
static DENY_WRITE: SpinLock<BTreeMap<InodeNumber, usize>> = SpinLock::new(BTreeMap::new());

/// Marks `ino` as deny-write, incrementing its refcount.
pub fn mark_deny_write(ino: InodeNumber) {
    let mut guard = DENY_WRITE.lock();
    *guard.entry(ino).or_insert(0) += 1;
    guard.unlock();
}

/// Releases one deny-write hold on `ino`, removing the entry once the
/// refcount reaches zero.
pub fn unmark_deny_write(ino: InodeNumber) {
    let mut guard = DENY_WRITE.lock();
    if let Some(count) = guard.get_mut(&ino) {
        *count -= 1;
        if *count == 0 {
            guard.remove(&ino);
        }
    }
    guard.unlock();
}

/// Reports whether `ino` currently denies write access.
pub fn is_write_denied(ino: InodeNumber) -> bool {
    let guard = DENY_WRITE.lock();
    let denied = guard.contains_key(&ino);
    guard.unlock();
    denied
}

/// The filesystem state of a process, corresponding to Linux's
/// `struct files_struct`.
///
/// Holds the process's current working directory and its file descriptor
/// table. The table is a fixed-capacity array rather than a growable map:
/// every process has the same hard cap on simultaneously open files, and a
/// plain array keeps descriptor lookups branch-free.
pub struct FileStruct {
    /// The current working directory of the process.
    pub cwd: Directory,
    slots: [Option<File>; FD_MAX],
}

impl Clone for FileStruct {
    fn clone(&self) -> Self {
        let mut slots: [Option<File>; FD_MAX] = core::array::from_fn(|_| None);
        for (dst, src) in slots.iter_mut().zip(self.slots.iter()) {
            *dst = src.clone();
        }
        Self {
            cwd: self.cwd.clone(),
            slots,
        }
    }
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStruct {
    /// Creates a fresh [`FileStruct`] with only stdin/stdout populated.
    pub fn new() -> Self {
        let mut slots: [Option<File>; FD_MAX] = core::array::from_fn(|_| None);
        slots[0] = Some(File {
            mode: FileMode::Read,
            file: FileKind::Stdio,
        });
        slots[1] = Some(File {
            mode: FileMode::Write,
            file: FileKind::Stdio,
        });
        Self {
            cwd: keos::fs::FileSystem::root(),
            slots,
        }
    }

    fn index_of(fd: FileDescriptor) -> Option<usize> {
        usize::try_from(fd.0).ok().filter(|&i| i < FD_MAX)
    }

    /// Returns a reference to the entry at `fd`, if any.
    pub fn get(&self, fd: FileDescriptor) -> Option<&File> {
        Self::index_of(fd).and_then(|i| self.slots[i].as_ref())
    }

    /// Returns a mutable reference to the entry at `fd`, if any.
    pub fn get_mut(&mut self, fd: FileDescriptor) -> Option<&mut File> {
        Self::index_of(fd).and_then(|i| self.slots[i].as_mut())
    }

    /// Installs `file` at the exact slot `fd`, overwriting whatever was
    /// there. Out-of-range descriptors are silently ignored.
    pub fn set(&mut self, fd: FileDescriptor, file: File) {
        if let Some(i) = Self::index_of(fd) {
            self.slots[i] = Some(file);
        }
    }

    /// Removes and returns the entry at `fd`, if any.
    pub fn free(&mut self, fd: FileDescriptor) -> Option<File> {
        Self::index_of(fd).and_then(|i| self.slots[i].take())
    }

    /// Reports whether no descriptor beyond stdio is currently occupied.
    pub fn is_empty(&self) -> bool {
        self.slots[2..].iter().all(|s| s.is_none())
    }

    fn find_empty(&self) -> Option<FileDescriptor> {
        self.slots[2..]
            .iter()
            .position(Option::is_none)
            .map(|i| FileDescriptor((i + 2) as i32))
    }

    /// Installs `file` into the lowest free descriptor (starting at 2).
    ///
    /// # Errors
    /// Returns [`KernelError::TooManyOpenFile`] if every slot is occupied.
    pub fn install_file(&mut self, file: File) -> Result<FileDescriptor, KernelError> {
        let fd = self.find_empty().ok_or(KernelError::TooManyOpenFile)?;
        self.set(fd, file);
        Ok(fd)
    }

    /// Closes every non-stdio descriptor. Called when a process exits.
    ///
    /// This drops the underlying [`RegularFile`]/[`Directory`] handles but
    /// does not touch the deny-write refcount: that hold belongs to the
    /// process's loaded executable, not to any individual descriptor, and is
    /// released separately when the process itself exits.
    pub fn close_all(&mut self) {
        for slot in self.slots[2..].iter_mut() {
            *slot = None;
        }
    }

    /// Opens a file relative to the process's current working directory.
    ///
    /// # Syscall API
    /// ```c
    /// int open(const char *pathname, int flags);
    /// ```
    pub fn open(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        let mode = match abi.arg2 {
            0 => FileMode::Read,
            1 => FileMode::Write,
            2 => FileMode::ReadWrite,
            _ => return Err(KernelError::InvalidArgument),
        };
        let entry = self.cwd.open(&path)?;
        let file = match entry {
            FsFile::RegularFile(file) => File {
                mode,
                file: FileKind::RegularFile { file, position: 0 },
            },
            FsFile::Directory(dir) => File {
                mode: FileMode::Read,
                file: FileKind::Directory { dir, position: 0 },
            },
        };
        self.install_file(file).map(|fd| fd.0 as usize)
    }

    /// Creates a new file (or directory) at `path`.
    ///
    /// # Syscall API
    /// ```c
    /// bool create(const char *path, unsigned initial_size);
    /// ```
    /// KeOS files have no preallocated size, so `initial_size` is accepted
    /// but otherwise unused.
    pub fn create(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        self.cwd.create(&path, false)?;
        Ok(1)
    }

    /// Unlinks the file at `path`.
    ///
    /// # Syscall API
    /// ```c
    /// bool remove(const char *path);
    /// ```
    pub fn remove(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        self.cwd.unlink(&path)?;
        Ok(1)
    }

    /// Returns the size, in bytes, of the file referenced by `fd`.
    ///
    /// # Syscall API
    /// ```c
    /// int filesize(int fd);
    /// ```
    pub fn filesize(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let entry = self.get(fd).ok_or(KernelError::BadFileDescriptor)?;
        match &entry.file {
            FileKind::RegularFile { file, .. } => Ok(file.size()),
            FileKind::Directory { dir, .. } => Ok(dir.size()),
            FileKind::Stdio => Err(KernelError::InvalidArgument),
        }
    }

    /// Reads data from an open file into a user buffer.
    ///
    /// # Syscall API
    /// ```c
    /// ssize_t read(int fd, void *buf, size_t count);
    /// ```
    pub fn read(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let dst = UserU8SliceWO::new(abi.arg2, abi.arg3);
        match fd {
            FileDescriptor(0) => {
                let mut data = alloc::vec![0u8; abi.arg3];
                let n = serial().lock().read(&mut data)?;
                dst.put(&data[..n])
            }
            FileDescriptor(1) => Err(KernelError::BadFileDescriptor),
            _ => {
                let entry = self.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
                match &mut entry.file {
                    FileKind::RegularFile { file, position } => {
                        let mut data = alloc::vec![0u8; abi.arg3];
                        let n = file.read(*position, &mut data)?;
                        *position += n;
                        dst.put(&data[..n])
                    }
                    FileKind::Directory { .. } | FileKind::Stdio => {
                        Err(KernelError::InvalidArgument)
                    }
                }
            }
        }
    }

    /// Writes data from a user buffer to an open file.
    ///
    /// # Syscall API
    /// ```c
    /// ssize_t write(int fd, const void *buf, size_t count);
    /// ```
    ///
    /// Fails with [`KernelError::Busy`] if the target file is currently
    /// deny-write (e.g. it backs a running executable's text).
    pub fn write(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let src = UserU8SliceRO::new(abi.arg2, abi.arg3);
        match fd {
            FileDescriptor(0) => Err(KernelError::BadFileDescriptor),
            FileDescriptor(1) => {
                let data = src.get()?;
                serial().lock().write(&data)
            }
            _ => {
                let entry = self.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
                match &mut entry.file {
                    FileKind::RegularFile { file, position } => {
                        if is_write_denied(file.ino()) {
                            return Err(KernelError::Busy);
                        }
                        let data = src.get()?;
                        let n = file.write(*position, &data)?;
                        *position += n;
                        Ok(n)
                    }
                    FileKind::Directory { .. } | FileKind::Stdio => {
                        Err(KernelError::InvalidArgument)
                    }
                }
            }
        }
    }

    /// Moves the file pointer of `fd` to a new position.
    ///
    /// # Syscall API
    /// ```c
    /// off_t seek(int fd, off_t offset, int whence);
    /// ```
    pub fn seek(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let offset = abi.arg2 as isize;
        let whence = abi.arg3;
        let entry = self.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
        let (size, position) = match &mut entry.file {
            FileKind::RegularFile { file, position } => (file.size(), position),
            FileKind::Directory { dir, position } => (dir.size(), position),
            FileKind::Stdio => return Err(KernelError::InvalidArgument),
        };
        let base: isize = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *position as isize,
            SEEK_END => size as isize,
            _ => return Err(KernelError::InvalidArgument),
        };
        let new_position = base
            .checked_add(offset)
            .filter(|p| *p >= 0)
            .ok_or(KernelError::InvalidArgument)?;
        *position = new_position as usize;
        Ok(*position)
    }

    /// Returns the current file pointer position of `fd`.
    ///
    /// # Syscall API
    /// ```c
    /// off_t tell(int fd);
    /// ```
    pub fn tell(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let entry = self.get(fd).ok_or(KernelError::BadFileDescriptor)?;
        match &entry.file {
            FileKind::RegularFile { position, .. } | FileKind::Directory { position, .. } => {
                Ok(*position)
            }
            FileKind::Stdio => Err(KernelError::InvalidArgument),
        }
    }

    /// Closes an open file descriptor, releasing any deny-write hold it
    /// held.
    ///
    /// # Syscall API
    /// ```c
    /// int close(int fd);
    /// ```
    ///
    /// An fd that was never open is fatal, not an ordinary error: `Process`'s
    /// dispatcher turns the [`KernelError::BadFileDescriptor`] returned here
    /// into termination of the caller, so this just reports the failure.
    pub fn close(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        self.free(fd).ok_or(KernelError::BadFileDescriptor)?;
        Ok(0)
    }
}
