use crate::stack::{BorrowedStack, DefaultStack, Stack, MIN_STACK_SIZE, STACK_ALIGNMENT};

#[test]
fn default_stack_bounds() {
    let stack = DefaultStack::new(64 * 1024).unwrap();
    assert_eq!(stack.base().get() % STACK_ALIGNMENT, 0);
    assert_eq!(stack.limit().get() % STACK_ALIGNMENT, 0);
    assert!(stack.base().get() - stack.usable_limit().get() >= 64 * 1024);
    assert!(stack.usable_limit() >= stack.limit());
}

#[test]
fn usable_region_reads_and_writes() {
    let stack = DefaultStack::new(16 * 1024).unwrap();
    unsafe {
        let top = (stack.base().get() - 1) as *mut u8;
        let bottom = stack.usable_limit().get() as *mut u8;
        top.write(123);
        bottom.write(45);
        assert_eq!(top.read(), 123);
        assert_eq!(bottom.read(), 45);
    }
}

#[test]
fn minimum_size_is_applied() {
    let stack = DefaultStack::new(1).unwrap();
    assert!(stack.base().get() - stack.usable_limit().get() >= MIN_STACK_SIZE);
}

#[test]
fn allocate_release_soak() {
    // Every deinit must return the mapping to the OS; a leak here shows up
    // as monotonically growing address space under external tooling.
    for _ in 0..1000 {
        let stack = DefaultStack::new(1024 * 1024).unwrap();
        drop(stack);
    }
}

#[test]
fn borrowed_stack_clips_to_alignment() {
    let mut buffer = vec![0u8; MIN_STACK_SIZE + 64];
    let raw = buffer.as_ptr() as usize;
    let stack = BorrowedStack::new(&mut buffer[1..]);
    assert_eq!(stack.base().get() % STACK_ALIGNMENT, 0);
    assert_eq!(stack.limit().get() % STACK_ALIGNMENT, 0);
    assert!(stack.limit().get() >= raw + 1);
    assert!(stack.base().get() <= raw + MIN_STACK_SIZE + 64);
}

#[cfg(feature = "guard-pages")]
#[test]
#[ignore = "faults the process by design"]
fn guard_page_faults_on_write() {
    let stack = DefaultStack::new(16 * 1024).unwrap();
    unsafe {
        let below = (stack.usable_limit().get() - 1) as *mut u8;
        below.write(1);
    }
}

#[cfg(feature = "guard-pages")]
#[test]
#[ignore = "faults the process by design"]
fn guard_page_faults_above_base() {
    let stack = DefaultStack::new(16 * 1024).unwrap();
    unsafe {
        let above = stack.base().get() as *mut u8;
        above.write(1);
    }
}
