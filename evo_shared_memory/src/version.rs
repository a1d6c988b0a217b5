//! Layout version tags.
//!
//! Every process attaching to a segment must agree on the exact layout of
//! every structure stored in it. The tag is derived from size and alignment
//! at compile time and folded over all participating structures.

/// Layout hash of a single type.
pub const fn struct_version_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E3779B9) ^ align.wrapping_mul(0x517CC1B7)
}

/// Fold one more layout hash into an accumulated tag.
pub const fn combine_version(acc: u32, hash: u32) -> u32 {
    acc.rotate_left(5) ^ hash
}
