//! # User-process subsystem
//!
//! This crate is KeOS's user-process layer: it loads an executable image
//! into a fresh address space, dispatches the system calls a running
//! program traps into, and maintains the parent/child relationships that
//! `fork`, `wait`, and `exit` depend on.
//!
//! A [`process::Process`] bundles the three pieces of state every user task
//! needs:
//! - [`file_struct::FileStruct`] — the per-process file-descriptor table.
//! - [`mm_struct::MmStruct`] — the address space, parameterised over a
//!   [`pager::Pager`] policy ([`eager_pager::EagerPager`] or
//!   [`lazy_pager::LazyPager`]; [`process::Process`] uses the latter).
//! - [`process_record::ProcessRecord`] — the rendezvous point with its
//!   parent, if it has one.
//!
//! [`loader`] turns an on-disk ELF binary and an argv into a populated
//! address space and an initial register frame. [`fork`] duplicates a
//! running process's [`file_struct::FileStruct`] and [`mm_struct::MmStruct`]
//! into a new task. [`process::Process::syscall`] is the single entry point
//! that ties every syscall number to its handler.

#![no_std]
#![no_main]
#![feature(negative_impls)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod eager_pager;
pub mod file_struct;
pub mod fork;
pub mod lazy_pager;
pub mod loader;
pub mod mm_struct;
pub mod pager;
pub mod page_table;
pub mod process;
pub mod process_record;
pub mod sync;
pub mod syscall;

pub use process::Process;

use keos::KernelError;

/// System call numbers understood by [`Process::syscall`].
///
/// The numeric values match the user-space stub's calling convention; they
/// are not renumbered here for convenience.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallNumber {
    /// Stops the machine. Accepted as a no-op outside of real hardware.
    Halt = 0,
    /// Terminates the calling process.
    Exit = 1,
    /// Creates a new process by duplicating the caller.
    Fork = 2,
    /// Replaces the caller's address space with a new program image.
    Exec = 3,
    /// Blocks until a child terminates and reaps its exit code.
    Wait = 4,
    /// Creates a new file.
    Create = 5,
    /// Unlinks a file.
    Remove = 6,
    /// Opens a file, returning a file descriptor.
    Open = 7,
    /// Returns the size of an open file.
    Filesize = 8,
    /// Reads from an open file descriptor.
    Read = 9,
    /// Writes to an open file descriptor.
    Write = 10,
    /// Repositions an open file descriptor.
    Seek = 11,
    /// Returns the current position of an open file descriptor.
    Tell = 12,
    /// Closes an open file descriptor.
    Close = 13,
    /// Maps a file or anonymous memory into the caller's address space.
    Mmap = 14,
    /// Unmaps a previously mapped region.
    Munmap = 15,
}

impl TryFrom<usize> for SyscallNumber {
    type Error = KernelError;
    fn try_from(no: usize) -> Result<SyscallNumber, Self::Error> {
        match no {
            0 => Ok(SyscallNumber::Halt),
            1 => Ok(SyscallNumber::Exit),
            2 => Ok(SyscallNumber::Fork),
            3 => Ok(SyscallNumber::Exec),
            4 => Ok(SyscallNumber::Wait),
            5 => Ok(SyscallNumber::Create),
            6 => Ok(SyscallNumber::Remove),
            7 => Ok(SyscallNumber::Open),
            8 => Ok(SyscallNumber::Filesize),
            9 => Ok(SyscallNumber::Read),
            10 => Ok(SyscallNumber::Write),
            11 => Ok(SyscallNumber::Seek),
            12 => Ok(SyscallNumber::Tell),
            13 => Ok(SyscallNumber::Close),
            14 => Ok(SyscallNumber::Mmap),
            15 => Ok(SyscallNumber::Munmap),
            _ => Err(KernelError::NoSuchSyscall),
        }
    }
}
