//! # `fork`
//!
//! `fork` duplicates the calling process: a new task starts out with a copy
//! of the parent's [`FileStruct`] and [`MmStruct`], and its very first
//! instruction is the one right after the parent's `fork` call — except it
//! observes a return value of `0` instead of its own tid.
//!
//! ## Address-space duplication
//!
//! `fork` walks the [`VmAreaStruct`]s tracked by the parent's [`LazyPager`]
//! and eagerly copies every page currently resident in the parent's page
//! table into a freshly allocated page table for the child. Regions that
//! have not yet been demand-paged are simply re-registered in the child;
//! they get populated independently by each process's own page-fault
//! handler the first time they are touched.
//!
//! [`LazyPager::do_copy_on_write`] remains the page-fault path for a
//! present-but-write-protected page. It is not reached through the
//! duplication path above (which never write-protects a page it eagerly
//! copies), but a future pager in this family may still produce
//! write-protected mappings, so the handler stays correct and in place.

use crate::{
    file_struct::FileStruct,
    lazy_pager::{LazyPager, PageFaultReason},
    mm_struct::MmStruct,
    page_table::PageTable,
    process_record::ProcessRecord,
    syscall::SyscallAbi,
};
use alloc::sync::Arc;
use keos::{KernelError, addressing::PAGE_SIZE, mm::Page, thread::ThreadBuilder};

impl LazyPager {
    /// Handles a copy-on-write page fault by creating a private copy of the
    /// faulted page.
    pub fn do_copy_on_write(
        &mut self,
        page_table: &mut PageTable,
        reason: &PageFaultReason,
    ) -> Result<(), KernelError> {
        let page_addr = reason.fault_addr.page_down();
        let mut walked = page_table
            .walk_mut(page_addr)
            .map_err(|_| KernelError::InvalidAccess)?;
        let (_, area) = self
            .find_area(reason.fault_addr)
            .ok_or(KernelError::InvalidAccess)?;
        if !area.perm.contains(keos::mm::page_table::Permission::WRITE) {
            return Err(KernelError::InvalidAccess);
        }
        let old_pte = walked.clear().ok_or(KernelError::InvalidAccess)?;
        let old_page = old_pte.invalidate();
        let mut new_page = Page::new();
        new_page.inner_mut().copy_from_slice(old_page.inner());
        page_table
            .map(page_addr, new_page, area.perm)
            .map_err(|_| KernelError::InvalidAccess)
    }

    /// Duplicates the address space for `fork`: a fresh page table and
    /// pager whose tracked areas mirror the parent's, with every
    /// currently-resident page eagerly copied.
    pub fn duplicate(mm_struct: &mut MmStruct<LazyPager>) -> Result<MmStruct<LazyPager>, KernelError> {
        let MmStruct { page_table, pager } = mm_struct;
        let mut new_page_table = PageTable::new();
        let mut new_pager = LazyPager::new();

        for (start, area) in pager.areas() {
            new_pager.mmap_area(start, area.clone());
            let npages = area.size / PAGE_SIZE;
            for i in 0..npages {
                let va = start + i * PAGE_SIZE;
                if let Ok(pte) = page_table.walk(va) {
                    let mut new_page = Page::new();
                    new_page
                        .inner_mut()
                        .copy_from_slice(unsafe { keos::mm::PageRef::from_pa(pte.pa()) }.inner());
                    new_page_table
                        .map(va, new_page, area.perm)
                        .map_err(|_| KernelError::InvalidArgument)?;
                }
            }
        }

        Ok(MmStruct {
            page_table: new_page_table,
            pager: new_pager,
        })
    }
}

/// Creates a new process by duplicating the calling process.
///
/// # Syscall API
/// ```c
/// int fork(void);
/// ```
///
/// Duplicates address space and FD table synchronously in the parent, then
/// spawns the child and rendezvous with it through `record`: the child
/// posts `Created`/`Failed` once it has finished coming up, and the parent
/// either blocks on that signal or consumes an already-posted one.
///
/// Returns the child's tid on `Created`, or
/// [`KernelError::OperationNotPermitted`] on `Failed`.
pub fn fork(
    file_struct: &mut FileStruct,
    mm_struct: &mut MmStruct<LazyPager>,
    abi: &SyscallAbi,
    record: Arc<ProcessRecord>,
    create_task: impl FnOnce(FileStruct, MmStruct<LazyPager>) -> ThreadBuilder,
) -> Result<usize, KernelError> {
    let child_file_struct = file_struct.clone();
    let child_mm_struct = LazyPager::duplicate(mm_struct)?;
    let mut regs = *abi.regs;
    regs.gprs.rax = 0;

    let builder = create_task(child_file_struct, child_mm_struct);
    let tid = builder.get_tid();
    let child_record = record.clone();
    builder.spawn(move || {
        child_record.post_init(true);
        regs.launch()
    });

    if record.wait_for_init() {
        Ok(tid as usize)
    } else {
        Err(KernelError::OperationNotPermitted)
    }
}
