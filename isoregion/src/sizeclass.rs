/// Compact size classes for the GC trigger baseline.
///
/// A region remembers the live byte count of its previous sweep as a
/// single-byte size class rather than a full word. Classes are exact in
/// 8-byte granules up to 32 bytes, then advance in four mantissa steps
/// per power of two, so the decoded value is never more than 25% above
/// the encoded one.
const GRANULE: usize = 8;
const LINEAR_CLASSES: usize = 4;
const STEPS: usize = 4;

/// Decode a size class to its byte bound. Strictly monotonic until the
/// encoding saturates at `usize::MAX`.
pub fn class_to_size(class: u8) -> usize {
    let class = class as usize;
    if class <= LINEAR_CLASSES {
        return class * GRANULE;
    }

    let beyond = class - LINEAR_CLASSES;
    let exp = (beyond - 1) / STEPS;
    let mantissa = (beyond - 1) % STEPS + 1;
    let value = (LINEAR_CLASSES + mantissa) * GRANULE;

    // saturate when the shift would push set bits past the top of the
    // word; checked_shl only guards the shift amount, not the value
    if exp as u32 > value.leading_zeros() {
        usize::MAX
    } else {
        value << exp
    }
}

/// Encode a byte count as the smallest class whose decoded bound covers
/// it. Called once per sweep, so the scan over the 256 classes is cheap.
pub fn size_to_class(size: usize) -> u8 {
    let mut class = 0u8;
    while class_to_size(class) < size {
        if class == u8::MAX {
            break;
        }
        class += 1;
    }
    class
}
