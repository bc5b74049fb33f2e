//! Demand-paging scenarios: more virtual pages than frames, both
//! page-table configurations, all TLB policies.

use std::sync::Arc;

use minnow::fs::FsError;
use minnow::kern::sync::Semaphore;
use minnow::kern::thread::{self, ThreadBuilder};
use minnow::types::PAGE_SIZE;
use minnow::user::syscall::{read_user_byte, write_user_byte};
use minnow::vm::addr_space::AddressSpace;
use minnow::vm::page_table::TranslationMode;
use minnow::vm::tlb::TlbPolicy;
use minnow::{Kernel, KernelOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An image of `pages` pages where every byte of page `vpn` is `vpn`.
fn striped_image(pages: usize) -> Vec<u8> {
    let mut image = vec![0u8; pages * PAGE_SIZE];
    for (vpn, chunk) in image.chunks_mut(PAGE_SIZE).enumerate() {
        chunk.fill(vpn as u8);
    }
    image
}

fn pressure_scenario(translation: TranslationMode, tlb_policy: TlbPolicy) {
    const PAGES: usize = 32;
    const FRAMES: usize = 8;

    let kernel = Kernel::new(KernelOptions {
        num_phys_pages: FRAMES,
        translation,
        tlb_policy,
        ..KernelOptions::default()
    });
    let space = AddressSpace::new(&kernel, "prog", &striped_image(PAGES)).unwrap();
    thread::set_space(&kernel, Some(space.clone()));

    // First sweep: check the loaded stripe, then scribble one byte per
    // page.
    for vpn in 0..PAGES {
        let probe = vpn * PAGE_SIZE + vpn % PAGE_SIZE;
        assert_eq!(read_user_byte(&kernel, probe).unwrap(), vpn as u8);
        write_user_byte(&kernel, vpn * PAGE_SIZE, !(vpn as u8)).unwrap();
    }
    assert!(kernel.vm.stats.page_faults() > 0);
    assert!(
        kernel.vm.stats.swap_writes() > 0,
        "eviction under pressure must write dirty pages"
    );

    // Second sweep: everything written must have survived eviction.
    for vpn in 0..PAGES {
        assert_eq!(
            read_user_byte(&kernel, vpn * PAGE_SIZE).unwrap(),
            !(vpn as u8),
            "page {vpn} lost its write"
        );
        assert_eq!(
            read_user_byte(&kernel, vpn * PAGE_SIZE + 1).unwrap(),
            vpn as u8,
            "page {vpn} lost its original contents"
        );
    }

    // Third sweep re-reads only; the pages cycled in by the second sweep
    // are clean, so eviction stops writing to swap.
    let writes_after_second = kernel.vm.stats.swap_writes();
    for vpn in 0..PAGES {
        assert_eq!(
            read_user_byte(&kernel, vpn * PAGE_SIZE + 1).unwrap(),
            vpn as u8
        );
    }
    let new_writes = kernel.vm.stats.swap_writes() - writes_after_second;
    assert!(
        new_writes <= FRAMES as u64,
        "clean re-reads caused {new_writes} swap writes"
    );

    thread::set_space(&kernel, None);
    space.destroy(&kernel);
    assert_eq!(kernel.vm.free_frames(), FRAMES);
    assert_eq!(
        kernel.file_system.open(&kernel, &space.swap_path).unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn pressure_with_per_process_tables() {
    init_logging();
    pressure_scenario(TranslationMode::PerProcess, TlbPolicy::Lru);
}

#[test]
fn pressure_with_an_inverted_table() {
    init_logging();
    pressure_scenario(TranslationMode::Inverted, TlbPolicy::Lru);
}

#[test]
fn every_tlb_policy_translates_correctly() {
    init_logging();
    for policy in [TlbPolicy::Modulo, TlbPolicy::Fifo, TlbPolicy::Lru] {
        const PAGES: usize = 8;
        let kernel = Kernel::new(KernelOptions {
            num_phys_pages: PAGES,
            tlb_policy: policy,
            ..KernelOptions::default()
        });
        let space = AddressSpace::new(&kernel, "prog", &striped_image(PAGES)).unwrap();
        thread::set_space(&kernel, Some(space.clone()));

        // Everything is resident; faults here are TLB refills only.
        let reads_before = kernel.vm.stats.swap_reads();
        for round in 0..3 {
            for vpn in 0..PAGES {
                assert_eq!(
                    read_user_byte(&kernel, vpn * PAGE_SIZE + round).unwrap(),
                    vpn as u8,
                    "{policy:?} mistranslated page {vpn}"
                );
            }
        }
        assert!(kernel.vm.stats.page_faults() > 0);
        assert_eq!(
            kernel.vm.stats.swap_reads(),
            reads_before,
            "{policy:?} paged in resident pages"
        );

        thread::set_space(&kernel, None);
        space.destroy(&kernel);
    }
}

#[test]
fn local_replacement_waits_out_a_full_machine() {
    init_logging();
    const FRAMES: usize = 8;
    let kernel = Kernel::new(KernelOptions {
        num_phys_pages: FRAMES,
        translation: TranslationMode::PerProcess,
        ..KernelOptions::default()
    });

    let hog_ready = Arc::new(Semaphore::new("hog ready", 0));
    let release_hog = Arc::new(Semaphore::new("release hog", 0));

    // The hog takes every frame and parks.
    let hog_ready_c = hog_ready.clone();
    let release_hog_c = release_hog.clone();
    let hog = ThreadBuilder::new("hog").spawn(&kernel, move |k| {
        let space = AddressSpace::new(k, "hog", &striped_image(FRAMES)).unwrap();
        thread::set_space(k, Some(space.clone()));
        hog_ready_c.v(k);
        release_hog_c.p(k);
        thread::set_space(k, None);
        space.destroy(k);
    });

    hog_ready.p(&kernel);
    assert_eq!(kernel.vm.free_frames(), 0);

    // The victim has no resident pages, so local replacement cannot make
    // progress until the hog releases its frames; the fault path yields
    // and retries.
    let victim = ThreadBuilder::new("victim").spawn(&kernel, move |k| {
        let space = AddressSpace::new(k, "victim", &striped_image(4)).unwrap();
        thread::set_space(k, Some(space.clone()));
        assert_eq!(read_user_byte(k, 2 * PAGE_SIZE).unwrap(), 2);
        thread::set_space(k, None);
        space.destroy(k);
    });

    // Give the victim time to reach its fault loop, then free the
    // frames.
    for _ in 0..5 {
        thread::yield_now(&kernel);
    }
    release_hog.v(&kernel);

    thread::join(&kernel, &hog);
    thread::join(&kernel, &victim);
    assert_eq!(kernel.vm.free_frames(), FRAMES);
}
