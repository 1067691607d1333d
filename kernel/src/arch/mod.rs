/*
 * Architecture-Specific Support
 *
 * The only architecture this kernel targets is 32-bit protected-mode
 * x86; `x86` is not behind a `cfg` gate the way a multi-arch kernel
 * would gate it, since nothing else is built here.
 */

pub mod x86;

pub use self::x86::*;
