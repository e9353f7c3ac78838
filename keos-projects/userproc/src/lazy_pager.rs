//! # Lazy Paging
//!
//! Lazy paging, or demand paging, is another policy for paging, used by
//! modern operating systems. Unlike [`EagerPager`], the [`LazyPager`] defers
//! physical page allocation until a page fault occurs. This method optimizes
//! memory usage by mapping memory pages **on demand**, rather than
//! preallocating them.
//!
//! Instead of allocating physical memory during the `mmap` call, the OS records
//! **metadata** about the mapping and waits to allocate physical memory until
//! the first **page fault** on that region. When a page fault occurs, the
//! kernel allocates and maps the required physical page.
//! In other words, **page table entries are created only when accessed**.
//!
//! ## Page Fault in KeOS
//!
//! The main function responsible for handling page faults lies in
//! [`Task::page_fault`]. This resolves the page fault reason into
//! [`PageFaultReason`] by reading the `cr2`, which contains faulting address,
//! and decoding the error code on the interrupt stack.
//!
//! It then delegates the page fault handling into the
//! [`LazyPager::handle_page_fault`]. This method is responsible to look up the
//! lazy mapping metadata recorded during the `mmap` and determine whether the
//! fault is bogus fault or not. If the address is valid, it should allocate a
//! new physical page and maps the page into page table. Otherwise, killing the
//! current process by returning the [`KernelError`].
//!
//! ## [`VmAreaStruct`]
//!
//! The [`VmAreaStruct`] represents a range of virtual addresses that share the
//! same memory permissions, similar to the Linux kernel's `struct
//! vm_area_struct`. It serves as the core metadata structure for memory-mapped
//! regions created via `mmap`, capturing the virtual range and the method
//! for populating that region's contents on access.
//!
//! Each [`VmAreaStruct`] is associated with an implementation of the
//! [`MmLoader`] trait, which defines how the contents of a page should be
//! supplied when the region is accessed. This trait-based abstraction
//! enables the kernel to support multiple types of memory mappings in a uniform
//! way. For instance, file-backed mappings use a [`FileBackedLoader`], which
//! reads contents from a file, while anonymous mappings use an [`AnonLoader`],
//! which typically supplies zero-filled pages. Each loader implementation can
//! maintain its own internal state, supporting extensibility and encapsulates
//! the complexity of mapping behavior within each loader.
//!
//! The [`MmLoader`] trait provides a single method, `load`, which is called
//! during demand paging when a page fault occurs at an address within the
//! associated [`VmAreaStruct`]. The method must return a fully initialized
//! [`Page`] object corresponding to that virtual address. The returned page is
//! then mapped into the page table by the pager.
//!
//! This loader-based architecture provides a clean separation of concerns:
//! [`VmAreaStruct`] tracks regions and permissions, while [`MmLoader`]
//! encapsulates how pages are provisioned. This allows KeOS to support flexible
//! and efficient memory models while maintaining clean abstractions.
//!
//! [`EagerPager`]: crate::eager_pager::EagerPager

use alloc::{collections::btree_map::BTreeMap, sync::Arc};
#[cfg(doc)]
use keos::task::Task;
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
    mm::{Page, PageRef, page_table::Permission},
    task::PFErrorCode,
};
use crate::page_table::PageTable;
use crate::pager::Pager;

/// A trait for loading the contents of a virtual memory page on demand.
///
/// This trait abstracts the mechanism for supplying the contents of a page
/// during **demand paging**. It is used by a lazy pager when handling a
/// page fault for a region that has not yet been populated.
///
/// Implementors of this trait can define custom behaviors, such as reading
/// from a file, or zero-filling anonymous pages.
pub trait MmLoader
where
    Self: Send + Sync,
{
    /// Loads and returns the content for the page at the given virtual address.
    ///
    /// The pager will call this function when a page fault occurs at `addr`
    /// within the corresponding [`VmAreaStruct`]. This method must return a
    /// fully initialized [`Page`] containing the data for that virtual page.
    fn load(&self, addr: Va) -> Page;
}

/// A loader for anonymous memory regions.
///
/// [`AnonLoader`] is used for memory mappings that are not backed by any file.
/// When a page fault occurs, this loader simply returns a newly allocated
/// zero-filled [`Page`].
pub struct AnonLoader {}
impl MmLoader for AnonLoader {
    fn load(&self, _addr: Va) -> Page {
        let mut page = Page::new();
        page.inner_mut().fill(0);
        page
    }
}

/// A loader for file-backed memory regions.
///
/// [`FileBackedLoader`] is used for memory mappings backed by files, such as
/// when `mmap` is called with a regular file. This loader reads data from
/// the underlying file starting at a specific offset and returns it in a
/// newly allocated [`Page`].
pub struct FileBackedLoader {
    file: RegularFile,
    /// Virtual address where the mapping starts, used to compute the file
    /// offset for a given faulting address.
    area_start: Va,
    /// File offset corresponding to `area_start`.
    file_offset: usize,
}

impl MmLoader for FileBackedLoader {
    fn load(&self, addr: Va) -> Page {
        let mut page = Page::new();
        page.inner_mut().fill(0);
        let delta = addr.into_usize() - self.area_start.into_usize();
        let foff = self.file_offset + delta;
        let fsize = self.file.size();
        if foff < fsize {
            let n = core::cmp::min(PAGE_SIZE, fsize - foff);
            let _ = self.file.read(foff, &mut page.inner_mut()[..n]);
        }
        page
    }
}

/// Represents a memory-mapped region within a process's virtual address space,
/// corresponding to the Linux kernel's `struct vm_area_struct`.
#[derive(Clone)]
pub struct VmAreaStruct {
    /// A handle to the memory loader for this region.
    pub loader: Arc<dyn MmLoader>,
    /// Size of the area in bytes, always a multiple of [`PAGE_SIZE`].
    pub size: usize,
    /// Permission this area is mapped with.
    pub perm: Permission,
}

/// The [`LazyPager`] structure implements lazy paging, where memory pages are
/// mapped only when accessed (on page fault), instead of during `mmap` calls.
#[derive(Clone)]
pub struct LazyPager {
    areas: BTreeMap<Va, VmAreaStruct>,
}

impl LazyPager {
    fn find_area(&self, addr: Va) -> Option<(Va, &VmAreaStruct)> {
        let page_addr = addr.page_down();
        let (&start, area) = self.areas.range(..=page_addr).next_back()?;
        if page_addr.into_usize() < start.into_usize() + area.size {
            Some((start, area))
        } else {
            None
        }
    }

    /// Returns the areas currently tracked by this pager. Used by `fork` to
    /// clone the memory layout into a freshly created address space.
    pub fn areas(&self) -> impl Iterator<Item = (Va, &VmAreaStruct)> {
        self.areas.iter().map(|(va, area)| (*va, area))
    }

    /// Registers an already-constructed area. Used by `fork` to re-register
    /// the parent's mapping metadata in the child's pager without touching
    /// the child's page table.
    pub fn mmap_area(&mut self, start: Va, area: VmAreaStruct) {
        self.areas.insert(start, area);
    }
}

impl Pager for LazyPager {
    fn new() -> Self {
        LazyPager {
            areas: BTreeMap::new(),
        }
    }

    fn mmap(
        &mut self,
        _page_table: &mut PageTable,
        addr: Va,
        size: usize,
        prot: Permission,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<usize, KernelError> {
        if self.areas.contains_key(&addr) {
            return Err(KernelError::InvalidArgument);
        }
        let npages = size.div_ceil(PAGE_SIZE);
        let size = npages * PAGE_SIZE;
        let loader: Arc<dyn MmLoader> = match file {
            Some(f) => Arc::new(FileBackedLoader {
                file: f.clone(),
                area_start: addr,
                file_offset: offset,
            }),
            None => Arc::new(AnonLoader {}),
        };
        self.areas.insert(
            addr,
            VmAreaStruct {
                loader,
                size,
                perm: prot,
            },
        );
        Ok(addr.into_usize())
    }

    fn munmap(&mut self, page_table: &mut PageTable, addr: Va) -> Result<usize, KernelError> {
        let area = self
            .areas
            .remove(&addr)
            .ok_or(KernelError::InvalidArgument)?;
        let npages = area.size / PAGE_SIZE;
        for i in 0..npages {
            let _ = page_table.unmap(addr + i * PAGE_SIZE);
        }
        Ok(0)
    }

    fn get_user_page(
        &mut self,
        page_table: &mut PageTable,
        addr: Va,
    ) -> Option<(PageRef<'_>, Permission)> {
        let page_addr = addr.page_down();
        let (_, area) = self.find_area(addr)?;
        let perm = area.perm;
        if page_table.walk(page_addr).is_err() {
            self.do_lazy_load(
                page_table,
                &PageFaultReason {
                    fault_addr: addr,
                    is_write_access: false,
                    is_present: false,
                },
            )
            .ok()?;
        }
        let pte = page_table.walk(page_addr).ok()?;
        Some((unsafe { PageRef::from_pa(pte.pa()) }, perm))
    }

    fn access_ok(&self, va: Va, is_write: bool) -> bool {
        match self.find_area(va) {
            Some((_, area)) => !is_write || area.perm.contains(Permission::WRITE),
            None => false,
        }
    }
}

/// Represents the reason for a page fault in a virtual memory system.
#[derive(Debug)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,
    /// Indicates whether the fault was due to a write access violation.
    pub is_write_access: bool,
    /// Indicates whether the page that caused the fault is present in memory.
    pub is_present: bool,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
        }
    }

    /// Returns `true` if the fault is due to **demand paging**.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns `true` if the fault is due to **copy-on-write**.
    #[inline]
    pub fn is_cow_fault(&self) -> bool {
        self.is_present && self.is_write_access
    }
}

impl LazyPager {
    /// Handles a page fault by performing **lazy loading** of the faulting
    /// page.
    pub fn do_lazy_load(
        &mut self,
        page_table: &mut PageTable,
        reason: &PageFaultReason,
    ) -> Result<(), KernelError> {
        let page_addr = reason.fault_addr.page_down();
        let (start, area) = self
            .find_area(reason.fault_addr)
            .ok_or(KernelError::InvalidAccess)?;
        let _ = start;
        let page = area.loader.load(page_addr);
        page_table
            .map(page_addr, page, area.perm)
            .map_err(|_| KernelError::InvalidAccess)
    }

    /// Handles a **page fault** by allocating a physical page and updating the
    /// page table.
    pub fn handle_page_fault(
        &mut self,
        page_table: &mut PageTable,
        reason: &PageFaultReason,
    ) -> Result<(), KernelError> {
        if reason.is_demand_paging_fault() {
            self.do_lazy_load(page_table, reason)
        } else if reason.is_cow_fault() {
            self.do_copy_on_write(page_table, reason)
        } else {
            Err(KernelError::InvalidAccess)
        }
    }
}

