//! Arena lifecycle tests: create, attach, version check, teardown.

use evo_shared_memory::segment::segment_path;
use evo_shared_memory::{Arena, SHM_MIN_SIZE, ShmError, ShmResult};
use std::sync::atomic::Ordering;

fn unique(name: &str) -> String {
    format!("evo_hal_{}_{}", name, std::process::id())
}

#[test]
fn test_open_creates_then_attaches() -> ShmResult<()> {
    let name = unique("open_attach");

    let (first, created) = Arena::open(&name, SHM_MIN_SIZE, 0xABCD)?;
    assert!(created);
    let (second, created) = Arena::open(&name, SHM_MIN_SIZE, 0xABCD)?;
    assert!(!created);
    assert_eq!(first.attached(), 2);

    // Data written through one mapping is visible through the other
    let off = {
        let g = first.lock();
        let off = first.alloc_value(&g)?;
        first.set_root(&g, off);
        off
    };
    first.value(off).store(0xDEAD_BEEF, Ordering::Relaxed);
    assert_eq!(second.root(), off);
    assert_eq!(second.value(off).load(Ordering::Relaxed), 0xDEAD_BEEF);

    drop(first);
    assert!(segment_path(&name).exists());
    drop(second);
    assert!(!segment_path(&name).exists());
    Ok(())
}

#[test]
fn test_layout_mismatch_is_rejected() -> ShmResult<()> {
    let name = unique("mismatch");
    let arena = Arena::create(&name, SHM_MIN_SIZE, 1)?;

    match Arena::attach(&name, 2) {
        Err(ShmError::VersionMismatch { expected, found }) => {
            assert_eq!(expected, 2);
            assert_eq!(found, 1);
        }
        other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
    }
    // A failed attach does not count as a handle
    assert_eq!(arena.attached(), 1);
    Ok(())
}

#[test]
fn test_lock_is_shared_between_mappings() -> ShmResult<()> {
    let name = unique("shared_lock");
    let (a, _) = Arena::open(&name, SHM_MIN_SIZE, 3)?;
    let (b, _) = Arena::open(&name, SHM_MIN_SIZE, 3)?;

    let g = a.lock();
    assert!(b.try_lock().is_none());
    drop(g);
    assert!(b.try_lock().is_some());
    Ok(())
}

#[test]
fn test_heap_and_rt_regions_meet_without_overlap() -> ShmResult<()> {
    let arena = Arena::anonymous(SHM_MIN_SIZE, 9)?;
    let g = arena.lock();

    let mut heap_blocks = Vec::new();
    let mut rt_words = Vec::new();
    loop {
        let Ok(h) = arena.heap_alloc(&g, 200) else { break };
        heap_blocks.push(h);
        let Ok(r) = arena.alloc_rt(&g, 64, 8) else { break };
        rt_words.push(r);
    }

    let highest_heap = heap_blocks.iter().max().copied().unwrap_or(0);
    let lowest_rt = rt_words.iter().min().copied().unwrap_or(u32::MAX);
    assert!(highest_heap + 200 <= lowest_rt);
    let stats = arena.stats(&g);
    assert_eq!(stats.rt_used, rt_words.len() * 64);
    Ok(())
}
