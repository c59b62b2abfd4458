//! # Console Module
//!
//! Writes through the SBI console.
//! Implements macros `print!` and `println!` for formatted output.

use crate::sbi::console_putchar;
use core::fmt::{self, Arguments, Write};

struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print raw bytes, as handed over by `write(2)`.
pub fn write_bytes(bytes: &[u8]) {
    for &b in bytes {
        console_putchar(b as usize);
    }
}

/// Print formatted text.
pub fn print(args: Arguments) {
    let _ = Stdout.write_fmt(args);
}

/// print string
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?));
    };
}

/// print string with newline
#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?));
    }
}
