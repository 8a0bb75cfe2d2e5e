#![no_std]
#![no_main]
#![feature(allocator_api)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod driver;
pub mod error;
pub mod fs;
pub mod kernel_init;
pub mod mem;
pub mod vfs;

use core::panic::PanicInfo;

/// Freestanding panic sink: logs through whatever console is installed
/// (none, before `driver::serial::init`, in which case this is a no-op
/// per `eonix_log`'s guarded `Option`) and halts the core.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    eonix_log::println_fatal!("panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}
