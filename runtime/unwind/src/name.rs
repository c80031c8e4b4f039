//! Function names recovered from the image
//!
//! The toolchain places a name tag immediately before every function entry
//! (GCC's `-mpoke-function-name`):
//!
//! ```text
//!   entry - 4 - padded   name bytes, NUL padded to a word boundary
//!   entry - 4            0xff000000 | padded
//!   entry                first instruction
//! ```
//!
//! No symbol table is needed: the name sits next to the code it names.

use crate::memory::Memory;

/// Name reported when a function carries no (readable) tag
pub const UNKNOWN_NAME: &str = "???";

/// Marker in the most significant byte of a name tag
pub const NAME_MARKER: u32 = 0xff00_0000;

/// Longest name accepted from a tag
pub const MAX_NAME_LEN: usize = 256;

const TAG_SIZE: usize = core::mem::size_of::<u32>();
const LENGTH_MASK: u32 = !NAME_MARKER;

/// Resolve the name of the function starting at `entry`
pub fn name_of<M: Memory>(memory: &M, entry: usize) -> &'static str {
    tagged_name(memory, entry).unwrap_or(UNKNOWN_NAME)
}

fn tagged_name<M: Memory>(memory: &M, entry: usize) -> Option<&'static str> {
    let tag_addr = entry.checked_sub(TAG_SIZE)?;
    let tag = u32::try_from(memory.word(tag_addr, TAG_SIZE)?).ok()?;
    if tag & NAME_MARKER != NAME_MARKER {
        return None;
    }

    let len = (tag & LENGTH_MASK) as usize;
    let padded = len.checked_add(TAG_SIZE - 1)? & !(TAG_SIZE - 1);
    if padded == 0 || padded > MAX_NAME_LEN {
        return None;
    }

    let raw = memory.bytes(tag_addr.checked_sub(padded)?, padded)?;
    let name = match raw.iter().position(|&b| b == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    };
    if name.is_empty() {
        return None;
    }
    core::str::from_utf8(name).ok()
}
