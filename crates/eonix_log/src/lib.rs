#![no_std]

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

pub trait ConsoleWrite: Sync {
    fn write(&self, s: &str);
}

struct Console {
    locked: AtomicBool,
    console: UnsafeCell<Option<&'static dyn ConsoleWrite>>,
}

// SAFETY: access to `console` is serialized by `locked`; the kernel runs
// single-threaded so there is never real contention, only reentrancy to guard against.
unsafe impl Sync for Console {}

static CONSOLE: Console = Console {
    locked: AtomicBool::new(false),
    console: UnsafeCell::new(None),
};

impl Console {
    fn with<R>(&self, f: impl FnOnce(&mut Option<&'static dyn ConsoleWrite>) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let result = f(unsafe { &mut *self.console.get() });
        self.locked.store(false, Ordering::Release);
        result
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        CONSOLE.with(|console| {
            if let Some(console) = console {
                console.write(s);
            }
        });
        Ok(())
    }
}

pub fn set_console(console: &'static dyn ConsoleWrite) {
    CONSOLE.with(|slot| *slot = Some(console));
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_warn {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: warn] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log_debug")]
        $crate::println!("[kernel:debug] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_info {
    ($($arg:tt)*) => {
        $crate::println!("[kernel: info] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_fatal {
    () => {
        $crate::println!("[kernel:fatal] ")
    };
    ($($arg:tt)*) => {
        $crate::println!("[kernel:fatal] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_trace {
    ($feat:literal) => {
        #[cfg(feature = $feat)]
        $crate::println!("[kernel:trace] ")
    };
    ($feat:literal, $($arg:tt)*) => {
        #[cfg(feature = $feat)]
        $crate::println!("[kernel:trace] {}", format_args!($($arg)*))
    };
}
