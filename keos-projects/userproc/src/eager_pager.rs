//! # Pager with Eager Paging Policy
//!
//! [`EagerPager`] is a concrete implementation of the [`Pager`] trait. As its
//! name implies, it follows an **eager allocation strategy**: physical pages
//! are allocated and mapped into the page table **immediately** at the time
//! of `mmap`, regardless of whether they are subsequently accessed.
//!
//! This approach ensures that all virtual pages in the mapped region are backed
//! by initialized physical memory at the time of mapping. These pages are
//! typically zero-filled and mapped with the requested permissions (e.g., read,
//! write, execute). This simplifies the memory model and avoids page faults
//! after mapping, making [`EagerPager`] a useful baseline pager.
//!
//! [`crate::lazy_pager::LazyPager`] instead defers physical memory allocation
//! until the first access (i.e. a page fault), which is what [`Process`] uses.
//!
//! ## Memory Loading
//!
//! The eager pager supports both anonymous and file-backed memory mappings.
//! **Anonymous mappings** in eager paging are backed by zero-initialized
//! memory. A **file-backed page** is populated by reading the corresponding
//! file offset at map time. KeOS does not provide write-back behavior for
//! file-backed pages.
//!
//! [`Process`]: crate::process::Process
use crate::{page_table::PageTable, pager::Pager};
use alloc::collections::btree_map::BTreeMap;
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
    mm::{Page, PageRef, page_table::Permission},
};

/// Represent a mapping of contiguous memory.
pub struct Mapping {
    /// Size of the area.
    mapping_size: usize,
    /// Permission of the area.
    perm: Permission,
}

/// [`EagerPager`] is a struct that implements the [`Pager`] trait.
/// It represents a pager strategy that is responsible for eager memory paging.
pub struct EagerPager {
    mappings: BTreeMap<Va, Mapping>,
}

impl Pager for EagerPager {
    /// Creates a new instance of [`EagerPager`].
    ///
    /// This constructor initializes an empty [`EagerPager`] struct.
    fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// Memory map function (`mmap`) for eager paging.
    ///
    /// This function maps the given memory region into page table.
    /// Returns an address for the mapped area.
    fn mmap(
        &mut self,
        page_table: &mut PageTable,
        addr: Va,
        size: usize,
        prot: Permission,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<usize, KernelError> {
        if self.mappings.contains_key(&addr) {
            return Err(KernelError::InvalidArgument);
        }
        let npages = size.div_ceil(PAGE_SIZE);
        for i in 0..npages {
            let va = addr + i * PAGE_SIZE;
            let mut page = Page::new();
            page.inner_mut().fill(0);
            if let Some(f) = file {
                let foff = offset + i * PAGE_SIZE;
                let fsize = f.size();
                if foff < fsize {
                    let n = core::cmp::min(PAGE_SIZE, fsize - foff);
                    f.read(foff, &mut page.inner_mut()[..n])?;
                }
            }
            if page_table.map(va, page, prot).is_err() {
                // Roll back the pages mapped so far before failing.
                for j in 0..i {
                    let _ = page_table.unmap(addr + j * PAGE_SIZE);
                }
                return Err(KernelError::InvalidArgument);
            }
        }
        self.mappings.insert(
            addr,
            Mapping {
                mapping_size: npages * PAGE_SIZE,
                perm: prot,
            },
        );
        Ok(addr.into_usize())
    }

    /// Memory unmap function (`munmap`) for eager paging.
    ///
    /// This function would unmap a previously mapped memory region, releasing
    /// any associated resources.
    fn munmap(&mut self, page_table: &mut PageTable, addr: Va) -> Result<usize, KernelError> {
        let mapping = self
            .mappings
            .remove(&addr)
            .ok_or(KernelError::InvalidArgument)?;
        let npages = mapping.mapping_size / PAGE_SIZE;
        for i in 0..npages {
            let _ = page_table.unmap(addr + i * PAGE_SIZE);
        }
        Ok(0)
    }

    /// Find a mapped page at the given virtual address.
    ///
    /// This function searches for a memory page mapped at `addr` and, if found,
    /// returns a tuple of [`PageRef`] to the page and its corresponding
    /// [`Permission`] flags.
    fn get_user_page(
        &mut self,
        page_table: &mut PageTable,
        addr: Va,
    ) -> Option<(PageRef<'_>, Permission)> {
        let page_addr = addr.page_down();
        let (&start, mapping) = self.mappings.range(..=page_addr).next_back()?;
        if page_addr.into_usize() >= start.into_usize() + mapping.mapping_size {
            return None;
        }
        let pte = page_table.walk(page_addr).ok()?;
        Some((unsafe { PageRef::from_pa(pte.pa()) }, mapping.perm))
    }

    /// Checks whether access to the given virtual address is permitted.
    ///
    /// This function verifies that a virtual address `va` is part of a valid
    /// memory mapping and that the requested access type (read or write) is
    /// allowed by the page's protection flags.
    fn access_ok(&self, va: Va, is_write: bool) -> bool {
        let page_addr = va.page_down();
        match self.mappings.range(..=page_addr).next_back() {
            Some((&start, mapping))
                if page_addr.into_usize() < start.into_usize() + mapping.mapping_size =>
            {
                !is_write || mapping.perm.contains(Permission::WRITE)
            }
            _ => false,
        }
    }
}
