use keos::{addressing::Va, mm::page_table::Permission};
use userproc::{
    lazy_pager::LazyPager,
    mm_struct::MmStruct,
};

/// Unlike an eager pager, mapping a region never touches the page table:
/// `access_ok` must already see the area right after `mmap`, while the page
/// table entry only appears once the page is actually faulted in.
pub fn mmap_is_lazy() {
    let mut mm: MmStruct<LazyPager> = MmStruct::new();
    let va = Va::new(0x4000).unwrap();

    assert_eq!(
        mm.do_mmap(va, 0x1000, Permission::READ | Permission::WRITE, None, 0),
        Ok(0x4000)
    );
    assert!(
        mm.access_ok(va..va + 0xfff, true),
        "access_ok is metadata-only and must see the area immediately"
    );
    assert!(
        mm.page_table.walk(va).is_err(),
        "no page table entry should exist before the first access"
    );
}

pub fn get_user_page_triggers_lazy_load() {
    let prev_cr3 = keos::mm::page_table::get_current_pt_pa();
    let mut mm: MmStruct<LazyPager> = MmStruct::new();
    let va = Va::new(0x4000).unwrap();

    assert!(
        mm.do_mmap(va, 0x1000, Permission::READ | Permission::WRITE, None, 0)
            .is_ok()
    );
    assert!(mm.page_table.walk(va).is_err());

    keos::mm::page_table::load_pt(mm.page_table.pa());
    assert!(
        mm.get_user_page_and(va, |mut page, _| {
            page.inner_mut()[0] = 0x7;
        })
        .is_ok()
    );
    assert!(
        mm.page_table.walk(va).is_ok(),
        "the first access should have populated the page table entry"
    );
    keos::mm::page_table::load_pt(prev_cr3);
}

pub fn munmap_clears_area_and_mapping() {
    let mut mm: MmStruct<LazyPager> = MmStruct::new();
    let va = Va::new(0x4000).unwrap();

    assert!(mm.do_mmap(va, 0x1000, Permission::READ, None, 0).is_ok());
    assert!(mm.access_ok(va..va + 0xfff, false));

    assert!(mm.pager.munmap(&mut mm.page_table, va).is_ok());
    assert!(
        !mm.access_ok(va..va + 0xfff, false),
        "munmap should remove the area from the pager's bookkeeping"
    );
}

pub fn double_mmap_same_address_rejected() {
    let mut mm: MmStruct<LazyPager> = MmStruct::new();
    let va = Va::new(0x4000).unwrap();

    assert!(mm.do_mmap(va, 0x1000, Permission::READ, None, 0).is_ok());
    assert!(
        mm.do_mmap(va, 0x1000, Permission::READ, None, 0).is_err(),
        "mapping an address that is already in use must fail"
    );
}

pub fn deny_write_blocks_writes_to_running_executable() {
    let cwd = keos::fs::FileSystem::root();
    assert_eq!(cwd.create("deny_write_fixture", false).map(|_| ()), Ok(()));
    let file = cwd
        .open("deny_write_fixture")
        .unwrap()
        .into_regular_file()
        .unwrap();
    let ino = file.ino();

    assert!(!userproc::file_struct::is_write_denied(ino));
    userproc::file_struct::mark_deny_write(ino);
    assert!(userproc::file_struct::is_write_denied(ino));

    // A second concurrent mapping (e.g. `fork` keeping the image alive)
    // holds its own refcount; the file stays denied until both release it.
    userproc::file_struct::mark_deny_write(ino);
    userproc::file_struct::unmark_deny_write(ino);
    assert!(userproc::file_struct::is_write_denied(ino));

    userproc::file_struct::unmark_deny_write(ino);
    assert!(!userproc::file_struct::is_write_denied(ino));

    let _ = cwd.unlink("deny_write_fixture");
}
