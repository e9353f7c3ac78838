//! # Process Lifecycle
//!
//! A **process** is the unit of isolation in KeOS: it owns a private address
//! space, a private file-descriptor table, and a place in a parent/child
//! relationship with every other process. [`Process`] can `fork` into a new,
//! independent child, `exec` a fresh program image over itself, and `wait`
//! for a child's termination.
//!
//! ## Fork
//!
//! `fork` duplicates the calling process: [`crate::fork::fork`] clones the
//! [`FileStruct`] and eagerly copies the resident pages of the
//! [`MmStruct`], then spawns a new task whose very first instruction is the
//! one right after the parent's `fork` call, except that it observes a
//! return value of `0` instead of its own tid. The rendezvous between parent
//! and child runs through a [`ProcessRecord`], shared as an `Arc` between
//! the parent's [`Process::children`] registry and the child's
//! [`Process::self_record`].
//!
//! ## Exec
//!
//! `exec` replaces the calling process's address space with a freshly loaded
//! ELF image. On success it overwrites the caller's saved register frame in
//! place — the normal syscall-return path then resumes directly into the new
//! program's entry point, so the syscall never "returns" into the old image.
//! On failure it leaves the caller's address space untouched and returns an
//! error to user space.
//!
//! ## Wait
//!
//! `wait(pid)` looks up `pid` in the caller's child registry and, if found,
//! removes it and blocks on the child's [`ProcessRecord`] until it reports
//! `TERMINATED`. Removing the record up front means a second `wait` on the
//! same pid always observes "not my child", matching the one-shot reap
//! semantics expected of `wait`.
//!
//! ## Fatal termination
//!
//! A handful of outcomes are fatal to the calling process rather than
//! ordinary error returns: any [`KernelError::BadAddress`] surfaced by a
//! syscall handler, and the specific fd misuse of `read` from fd 1 or
//! `write` to fd 0. [`Process::terminate`] centralises this: it runs the
//! same cleanup as a normal `exit(-1)` without ever handing control back to
//! the faulting instruction.

use crate::{
    file_struct::FileStruct,
    fork::fork,
    lazy_pager::{LazyPager, PageFaultReason},
    loader::LoadContext,
    mm_struct::MmStruct,
    process_record::{ChildRegistry, ProcessRecord},
    syscall::SyscallAbi,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::Range;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    fs::{FileSystem, InodeNumber},
    syscall::{Registers, uaccess::UserCString},
    task::{PFErrorCode, Task},
    thread::{Current, ThreadBuilder, with_current},
};

/// A user process: its own file-descriptor table, its own address space,
/// and its place among its parent's children.
pub struct Process {
    /// The process's open files and current working directory.
    pub file_struct: FileStruct,
    /// The process's address space, paged in on demand.
    pub mm_struct: MmStruct<LazyPager>,
    /// Children this process has forked but not yet reaped via `wait`.
    children: ChildRegistry,
    /// This process's own record as seen by its parent, if it has one.
    /// `None` for the initial process spawned at boot.
    self_record: Option<Arc<ProcessRecord>>,
    /// Inode of the executable image currently mapped as this process's
    /// text, held deny-write while it runs.
    loaded_exe: Option<InodeNumber>,
}

impl Default for Process {
    fn default() -> Self {
        Self::from_file_mm_struct(FileStruct::new(), MmStruct::new())
    }
}

impl Process {
    /// Create a process with the given [`MmStruct`] and a fresh FD table.
    pub fn from_mm_struct(mm_struct: MmStruct<LazyPager>) -> Self {
        Self::from_file_mm_struct(FileStruct::new(), mm_struct)
    }

    /// Create a process with the given [`MmStruct`] and [`FileStruct`].
    pub fn from_file_mm_struct(file_struct: FileStruct, mm_struct: MmStruct<LazyPager>) -> Self {
        Self {
            file_struct,
            mm_struct,
            children: ChildRegistry::new(alloc::collections::BTreeMap::new()),
            self_record: None,
            loaded_exe: None,
        }
    }

    /// Loads `program` with `args` into a fresh address space, marking its
    /// backing inode deny-write for the lifetime of the mapping.
    fn load_image(
        program: &str,
        args: &[&str],
    ) -> Result<(MmStruct<LazyPager>, Registers, InodeNumber), KernelError> {
        let file = FileSystem::root()
            .open(program)
            .map_err(|_| KernelError::NoSuchEntry)?
            .into_regular_file()
            .ok_or(KernelError::NoExec)?;
        let ino = file.ino();
        crate::file_struct::mark_deny_write(ino);

        let result = LoadContext {
            mm_struct: MmStruct::new(),
            regs: Registers::new(),
        }
        .load(&file, args);

        match result {
            Ok(LoadContext { mm_struct, regs }) => Ok((mm_struct, regs, ino)),
            Err(e) => {
                crate::file_struct::unmark_deny_write(ino);
                Err(e)
            }
        }
    }

    /// Loads `cmdline`'s program and spawns it as a new, parentless process.
    ///
    /// Used once at boot to start the initial process. There is no parent to
    /// report failure to, so a load failure here is fatal to the kernel.
    pub fn spawn_initial(cmdline: &str) -> u64 {
        let (program, args) = split_cmdline(cmdline);
        let (mm_struct, regs, ino) = Self::load_image(program, &args)
            .unwrap_or_else(|e| panic!("failed to load initial program {program}: {e:?}"));

        let mut process = Self::from_mm_struct(mm_struct);
        process.loaded_exe = Some(ino);

        let builder = ThreadBuilder::new(program);
        let tid = builder.get_tid();
        builder.attach_task(Box::new(process)).spawn(move || regs.launch());
        tid
    }

    /// Creates a new process by duplicating the calling process.
    ///
    /// # Syscall API
    /// ```c
    /// int fork(void);
    /// ```
    ///
    /// Returns the child's tid to the parent, or an error sentinel if the
    /// child failed to come up. The child itself observes a return value of
    /// `0` (arranged via the register frame handed to it).
    pub fn fork(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = with_current(|th| th.name.clone());
        let record = Arc::new(ProcessRecord::new());
        let loaded_exe = self.loaded_exe;
        if let Some(ino) = loaded_exe {
            crate::file_struct::mark_deny_write(ino);
        }

        let child_record = record.clone();
        let result = fork(
            &mut self.file_struct,
            &mut self.mm_struct,
            abi,
            record.clone(),
            move |file_struct, mm_struct| {
                let mut child = Process::from_file_mm_struct(file_struct, mm_struct);
                child.loaded_exe = loaded_exe;
                child.self_record = Some(child_record);
                let builder = ThreadBuilder::new(&name);
                builder.attach_task(Box::new(child))
            },
        );

        match &result {
            Ok(tid) => {
                let mut children = self.children.lock();
                children.insert(*tid as u64, record);
                children.unlock();
            }
            Err(_) => {
                if let Some(ino) = loaded_exe {
                    crate::file_struct::unmark_deny_write(ino);
                }
            }
        }
        result
    }

    /// Replaces the calling process's address space with a freshly loaded
    /// program image.
    ///
    /// # Syscall API
    /// ```c
    /// int exec(const char *cmdline);
    /// ```
    ///
    /// On success this does not return to the caller in any meaningful
    /// sense: the saved register frame is overwritten with the new program's
    /// entry point, argument registers, and stack, so the syscall-return path
    /// resumes directly into it. On failure the caller's address space is
    /// left untouched and `-1` is returned.
    pub fn exec(&mut self, abi: &mut SyscallAbi) -> Result<usize, KernelError> {
        let cmdline = UserCString::new(abi.arg1).read()?;
        let (program, args) = split_cmdline(&cmdline);

        let (mm_struct, regs, ino) = Self::load_image(program, &args)?;

        if let Some(old_ino) = self.loaded_exe.take() {
            crate::file_struct::unmark_deny_write(old_ino);
        }
        self.mm_struct = mm_struct;
        self.loaded_exe = Some(ino);
        *abi.regs = regs;
        Ok(0)
    }

    /// Blocks until the child `pid` terminates and returns its exit code.
    ///
    /// # Syscall API
    /// ```c
    /// int wait(int pid);
    /// ```
    ///
    /// Fails if `pid` does not name a live, un-waited-for child of the
    /// caller: this covers "not my child", "unknown pid", and "already
    /// waited" alike, since a successful wait removes the child's record.
    pub fn wait(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let pid = abi.arg1 as u64;
        let record = {
            let mut children = self.children.lock();
            let record = children.remove(&pid);
            children.unlock();
            record
        };
        let record = record.ok_or(KernelError::OperationNotPermitted)?;
        Ok(record.wait_for_exit() as isize as usize)
    }

    /// Terminates the calling process.
    ///
    /// The exit code is the first argument (`arg1`) of the system call.
    /// This function does not return: it closes the process's open files,
    /// releases its executable's deny-write hold, prints the termination
    /// message, and exits the underlying thread, which in turn notifies any
    /// parent blocked in [`Process::wait`].
    pub fn exit(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let status = abi.arg1 as i32;
        self.do_exit(status)
    }

    fn do_exit(&mut self, status: i32) -> ! {
        self.file_struct.close_all();
        if let Some(ino) = self.loaded_exe.take() {
            crate::file_struct::unmark_deny_write(ino);
        }
        let name = with_current(|th| th.name.clone());
        keos::println!("{name}: exit({status})");
        if let Some(record) = self.self_record.as_ref() {
            record.post_exit(status);
        }
        Current::exit(status)
    }

    /// Terminates the calling process with exit code `-1`, for faults that
    /// are fatal by policy (bad user pointers, fd-misuse) rather than
    /// ordinary syscall failures.
    fn terminate(&mut self) -> ! {
        self.do_exit(-1)
    }
}

/// Splits a command line into its program name and full argv, collapsing
/// runs of whitespace.
fn split_cmdline(cmdline: &str) -> (&str, Vec<&str>) {
    let mut tokens = cmdline.split_whitespace();
    let program = tokens.next().unwrap_or("");
    let args = core::iter::once(program).chain(tokens).collect();
    (program, args)
}

impl Task for Process {
    fn syscall(&mut self, regs: &mut Registers) {
        let mut abi = SyscallAbi::from_registers(regs);
        let no = crate::SyscallNumber::try_from(abi.sysno);
        let no_copy = no.as_ref().ok().copied();

        // `read` from stdout and `write` to stdin are fatal fd misuse,
        // regardless of what the handler itself would have returned.
        if let Some(no) = no_copy {
            use crate::SyscallNumber::*;
            if matches!(
                (no, abi.arg1),
                (Read, 1) | (Write, 0)
            ) {
                self.terminate();
            }
        }

        let return_val = no.and_then(|no| {
            use crate::SyscallNumber::*;
            match no {
                Halt => {
                    keos::println!("Halt.");
                    Ok(0)
                }
                Exit => self.exit(&abi),
                Fork => self.fork(&abi),
                Exec => self.exec(&mut abi),
                Wait => self.wait(&abi),
                Create => self.file_struct.create(&abi),
                Remove => self.file_struct.remove(&abi),
                Open => self.file_struct.open(&abi),
                Filesize => self.file_struct.filesize(&abi),
                Read => self.file_struct.read(&abi),
                Write => self.file_struct.write(&abi),
                Seek => self.file_struct.seek(&abi),
                Tell => self.file_struct.tell(&abi),
                Close => self.file_struct.close(&abi),
                Mmap => self.mm_struct.mmap(&mut self.file_struct, &abi),
                Munmap => self.mm_struct.munmap(&abi),
            }
        });

        // A bad user pointer observed anywhere in a handler is fatal, not an
        // ordinary error return. So is `close` on an fd that was never open.
        let fatal = matches!(return_val, Err(KernelError::BadAddress))
            || matches!(
                (no_copy, &return_val),
                (
                    Some(crate::SyscallNumber::Close),
                    Err(KernelError::BadFileDescriptor)
                )
            );
        if fatal {
            self.terminate();
        }

        abi.set_return_value(return_val);
    }

    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        self.mm_struct.access_ok(addr, is_write)
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) {
        let reason = PageFaultReason::new(ec, cr2);
        let MmStruct { page_table, pager } = &mut self.mm_struct;
        if pager.handle_page_fault(page_table, &reason).is_err() {
            self.terminate();
        }
    }

    fn with_page_table_pa(&self, f: &fn(Pa)) {
        f(self.mm_struct.page_table.pa())
    }
}
