// This is test & bootstrap implementation.
// This file will be overwritten when grading.
#![no_std]
#![no_main]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
extern crate keos;
extern crate userproc;
#[macro_use]
extern crate grading;

mod mm_struct;
mod sync;
mod syscall;

use alloc::boxed::Box;
use keos::SystemConfigurationBuilder;
pub use userproc::Process;

use crate::syscall::syscall_abi;

#[unsafe(no_mangle)]
pub unsafe fn main(_config_builder: SystemConfigurationBuilder) {
    if let Ok(fs) = simple_fs::FileSystem::load(1) {
        keos::info!("Filesystem: use `SimpleFS`.");
        keos::fs::FileSystem::register(fs)
    }

    keos::thread::ThreadBuilder::new("test-prehook")
        .attach_task(Box::new(syscall::SyscallAbiValidator::default()))
        .spawn(|| {
            keos::print!("Validate syscall abi...");
            syscall_abi();
            keos::TestDriver::<Process>::start([
                // File descriptor table.
                &syscall::open_normal,
                &syscall::open_invalid,
                &syscall::read_write_roundtrip,
                &syscall::read_error_bad_fd,
                &syscall::write_error_bad_fd,
                &syscall::seek_and_tell,
                &syscall::filesize_and_remove,
                &syscall::close_bad_fd,
                &syscall::stdio_echo,
                // Process lifecycle.
                &syscall::exec_missing_program,
                &syscall::fork_wait_exit_code,
                &syscall::wait_reap_is_one_shot,
                &syscall::wait_on_non_child,
                &syscall::fatal_bad_pointer_write,
                &syscall::fatal_read_from_stdout,
                &syscall::fatal_write_to_stdin,
                // Memory mapping.
                &mm_struct::mmap_is_lazy,
                &mm_struct::get_user_page_triggers_lazy_load,
                &mm_struct::munmap_clears_area_and_mapping,
                &mm_struct::double_mmap_same_address_rejected,
                &mm_struct::deny_write_blocks_writes_to_running_executable,
                // Synchronization primitives.
                &sync::mutex::smoke,
                &sync::mutex::parking,
                &sync::mutex::smoke_many,
                &sync::condition_variable::bounded_buffer_1,
                &sync::condition_variable::bounded_buffer_2,
                &sync::semaphore::sema_0,
                &sync::semaphore::sema_1,
                &sync::semaphore::sema_2,
                &sync::semaphore::exec_order,
                &sync::semaphore::n_permits,
            ]);
        });
}

#[unsafe(no_mangle)]
pub unsafe fn ap_main() {}
