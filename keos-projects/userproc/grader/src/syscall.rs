use keos::KernelError;
use userproc::{SyscallNumber, syscall::SyscallAbi};

/// A task used only to check that [`SyscallAbi::from_registers`] extracts
/// sysno/args from the right registers, independent of any real syscall
/// handler.
#[derive(Default)]
pub struct SyscallAbiValidator {}
impl keos::task::Task for SyscallAbiValidator {
    fn syscall(&mut self, registers: &mut keos::syscall::Registers) {
        let abi = SyscallAbi::from_registers(registers);
        let return_val = match abi.sysno {
            0x10000 => Ok(abi.arg1),
            0x10001 => Ok(abi.arg2),
            0x10002 => Ok(abi.arg3),
            0x10003 => Ok(abi.arg4),
            0x10004 => Ok(abi.arg5),
            0x10005 => Ok(abi.arg6),
            0x10006 => Err(KernelError::InvalidArgument),
            o => Ok(o),
        };
        abi.set_return_value(return_val);
    }
}

pub fn syscall_abi() {
    assert_eq!(
        syscall!(0x1234, 0x31331, 0x31332, 0x31333, 0x31334, 0x31335, 0x31336),
        0x1234,
        "sysno != 0x1234."
    );
    assert_eq!(
        syscall!(
            0x10000, 0x31331, 0x31332, 0x31333, 0x31334, 0x31335, 0x31336
        ),
        0x31331,
        "arg1 != 0x31331."
    );
    assert_eq!(
        syscall!(
            0x10005, 0x31331, 0x31332, 0x31333, 0x31334, 0x31335, 0x31336
        ),
        0x31336,
        "arg6 != 0x31336."
    );
    assert_eq!(
        syscall!(
            0x10006, 0x31331, 0x31332, 0x31333, 0x31334, 0x31335, 0x31336
        ),
        -22,
        "retval != KernelError::InvalidArgument."
    );
}

/// Creates a fresh scratch file at `path` containing `content`, via the
/// syscall surface itself rather than a preloaded fixture.
fn seed_file(path: &core::ffi::CStr, content: &[u8]) {
    assert_eq!(syscall!(SyscallNumber::Create as usize, path.as_ptr(), 0usize), 1);
    let fd = syscall!(SyscallNumber::Open as usize, path.as_ptr(), 1usize);
    assert!(fd >= 0, "open for write should succeed after create");
    assert_eq!(
        syscall!(
            SyscallNumber::Write as usize,
            fd as usize,
            content.as_ptr() as usize,
            content.len()
        ),
        content.len() as isize
    );
    assert_eq!(syscall!(SyscallNumber::Close as usize, fd as usize), 0);
}

pub fn open_normal() {
    seed_file(c"open_normal", b"hi");
    let fd1 = syscall!(SyscallNumber::Open as usize, c"open_normal".as_ptr(), 0usize);
    assert!(fd1 >= 2, "a fresh descriptor is never 0 or 1");
    let fd2 = syscall!(SyscallNumber::Open as usize, c"open_normal".as_ptr(), 2usize);
    assert!(fd2 >= 2);
    assert_ne!(fd1, fd2, "each open hands out a distinct descriptor");
}

pub fn open_invalid() {
    assert_eq!(
        syscall!(SyscallNumber::Open as usize, c"does_not_exist".as_ptr(), 0usize).try_into(),
        Ok(KernelError::NoSuchEntry)
    );
    assert_eq!(
        syscall!(SyscallNumber::Open as usize, c"open_normal".as_ptr(), 9999usize).try_into(),
        Ok(KernelError::InvalidArgument),
        "an undefined open mode is rejected"
    );
}

pub fn read_write_roundtrip() {
    seed_file(c"rw_roundtrip", b"");
    let fd = syscall!(SyscallNumber::Open as usize, c"rw_roundtrip".as_ptr(), 2usize);
    assert!(fd >= 0);
    let payload = b"roundtrip payload";
    assert_eq!(
        syscall!(
            SyscallNumber::Write as usize,
            fd as usize,
            payload.as_ptr() as usize,
            payload.len()
        ),
        payload.len() as isize
    );
    assert_eq!(syscall!(SyscallNumber::Seek as usize, fd as usize, 0usize, 0usize), 0);

    let mut buf = [0u8; 32];
    let n = syscall!(
        SyscallNumber::Read as usize,
        fd as usize,
        buf.as_mut_ptr() as usize,
        buf.len()
    );
    assert_eq!(n, payload.len() as isize);
    assert_eq!(&buf[..n as usize], payload);
    assert_eq!(syscall!(SyscallNumber::Close as usize, fd as usize), 0);
}

pub fn read_error_bad_fd() {
    assert_eq!(
        syscall!(SyscallNumber::Read as usize, 97usize, 0usize, 0usize).try_into(),
        Ok(KernelError::BadFileDescriptor)
    );
}

pub fn write_error_bad_fd() {
    assert_eq!(
        syscall!(SyscallNumber::Write as usize, 97usize, 0usize, 0usize).try_into(),
        Ok(KernelError::BadFileDescriptor)
    );
}

pub fn seek_and_tell() {
    seed_file(c"seek_and_tell", b"0123456789");
    let fd = syscall!(SyscallNumber::Open as usize, c"seek_and_tell".as_ptr(), 0usize);
    assert!(fd >= 0);

    assert_eq!(syscall!(SyscallNumber::Seek as usize, fd as usize, 4usize, 0usize), 4);
    assert_eq!(syscall!(SyscallNumber::Tell as usize, fd as usize), 4);

    assert_eq!(syscall!(SyscallNumber::Seek as usize, fd as usize, 2usize, 1usize), 6);
    assert_eq!(syscall!(SyscallNumber::Seek as usize, fd as usize, 0usize, 2usize), 10);

    assert_eq!(
        syscall!(SyscallNumber::Seek as usize, fd as usize, -1isize as usize, 0usize).try_into(),
        Ok(KernelError::InvalidArgument),
        "seeking before the start of the file is rejected"
    );
    assert_eq!(
        syscall!(SyscallNumber::Seek as usize, fd as usize, 0usize, 42usize).try_into(),
        Ok(KernelError::InvalidArgument),
        "an undefined whence is rejected"
    );
    assert_eq!(syscall!(SyscallNumber::Close as usize, fd as usize), 0);
}

pub fn filesize_and_remove() {
    seed_file(c"filesize_and_remove", b"abcd");
    let fd = syscall!(SyscallNumber::Open as usize, c"filesize_and_remove".as_ptr(), 0usize);
    assert!(fd >= 0);
    assert_eq!(syscall!(SyscallNumber::Filesize as usize, fd as usize), 4);
    assert_eq!(syscall!(SyscallNumber::Close as usize, fd as usize), 0);
    assert_eq!(syscall!(SyscallNumber::Remove as usize, c"filesize_and_remove".as_ptr()), 1);
    assert_eq!(
        syscall!(SyscallNumber::Open as usize, c"filesize_and_remove".as_ptr(), 0usize).try_into(),
        Ok(KernelError::NoSuchEntry)
    );
}

pub fn close_bad_fd() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        syscall!(SyscallNumber::Close as usize, 97usize);
        unreachable!("closing an fd that was never open is fatal");
    }
    assert_eq!(syscall!(SyscallNumber::Wait as usize, ret as usize), -1);
}

#[stdin(b"hello from stdin")]
#[assert_output(b"hello from stdin")]
pub fn stdio_echo() {
    let mut buf = [0u8; 17];
    let n = syscall!(
        SyscallNumber::Read as usize,
        0usize,
        buf.as_mut_ptr() as usize,
        buf.len()
    );
    assert!(n > 0);
    assert_eq!(
        syscall!(
            SyscallNumber::Write as usize,
            1usize,
            buf.as_ptr() as usize,
            n as usize
        ),
        n
    );
}

pub fn exec_missing_program() {
    assert_eq!(
        syscall!(SyscallNumber::Exec as usize, c"/no/such/program".as_ptr()).try_into(),
        Ok(KernelError::NoSuchEntry),
        "exec of a missing program fails without disturbing the caller"
    );
    // The caller is still alive and its registers were left untouched; a
    // plain syscall still dispatches normally afterwards.
    assert_eq!(syscall!(SyscallNumber::Filesize as usize, 0usize).try_into(), Ok(KernelError::InvalidArgument));
}

pub fn fork_wait_exit_code() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        syscall!(SyscallNumber::Exit as usize, 42usize);
        unreachable!("exit never returns");
    }
    assert!(ret > 0, "fork returns the child's tid to the parent");
    assert_eq!(
        syscall!(SyscallNumber::Wait as usize, ret as usize),
        42,
        "wait observes the child's exit code"
    );
}

pub fn wait_reap_is_one_shot() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        syscall!(SyscallNumber::Exit as usize, 7usize);
        unreachable!("exit never returns");
    }
    assert_eq!(syscall!(SyscallNumber::Wait as usize, ret as usize), 7);
    assert_eq!(
        syscall!(SyscallNumber::Wait as usize, ret as usize).try_into(),
        Ok(KernelError::OperationNotPermitted),
        "a second wait on an already-reaped child is not the caller's child"
    );
}

pub fn wait_on_non_child() {
    assert_eq!(
        syscall!(SyscallNumber::Wait as usize, 0xdead_beefusize).try_into(),
        Ok(KernelError::OperationNotPermitted)
    );
}

pub fn fatal_bad_pointer_write() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        // A pointer below PAGE_SIZE can never name valid user memory.
        syscall!(SyscallNumber::Write as usize, 1usize, 0x1usize, 10usize);
        unreachable!("a bad-address syscall terminates the caller");
    }
    assert_eq!(
        syscall!(SyscallNumber::Wait as usize, ret as usize),
        -1,
        "the child was killed with exit code -1"
    );
}

pub fn fatal_read_from_stdout() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        let mut buf = [0u8; 4];
        syscall!(
            SyscallNumber::Read as usize,
            1usize,
            buf.as_mut_ptr() as usize,
            buf.len()
        );
        unreachable!("reading from the write-only stdout descriptor is fatal");
    }
    assert_eq!(syscall!(SyscallNumber::Wait as usize, ret as usize), -1);
}

pub fn fatal_write_to_stdin() {
    let ret = syscall!(SyscallNumber::Fork as usize);
    if ret == 0 {
        let buf = [0u8; 4];
        syscall!(
            SyscallNumber::Write as usize,
            0usize,
            buf.as_ptr() as usize,
            buf.len()
        );
        unreachable!("writing to the read-only stdin descriptor is fatal");
    }
    assert_eq!(syscall!(SyscallNumber::Wait as usize, ret as usize), -1);
}
