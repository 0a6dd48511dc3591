//! Architecture-specific context switching.
//!
//! Each backend provides a `Context` (callee-saved register block),
//! `init_context` to arm a fresh stack, and the `context_switch` primitive:
//! save the callee-saved set plus a resume point into `old`, load from
//! `new`, jump. Nothing else crosses this seam.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, context_switch, init_context};
    } else {
        compile_error!("unsupported architecture: weft needs x86_64 or aarch64");
    }
}
