//! Wraparound-safe arithmetic over the 16-bit sequence space.
//!
//! Sequence ids are unsigned counters that wrap, so `<` is meaningless near the
//!  wrap point: id 3 sent right after id 65530 is *newer*, not older. All
//!  comparisons in the protocol go through [`le`]/[`ge`], which treat two ids
//!  as comparable as long as their distance along the number circle is less
//!  than a threshold of half the type's range. The functions are generic over
//!  the counter width so the exhaustive property tests can sweep a full `u8`
//!  space; the protocol itself uses `u16` throughout.

/// An unsigned counter type with wrapping semantics.
pub trait Counter: Copy + PartialEq + PartialOrd {
    const MAX: Self;
    const ONE: Self;
    /// half the type's range, the default comparison threshold
    const THRESHOLD: Self;

    fn wrapping_sub(self, other: Self) -> Self;
    fn wrapping_inc(self) -> Self;
    fn is_zero(self) -> bool;
}

macro_rules! impl_counter {
    ($($t:ty),*) => {$(
        impl Counter for $t {
            const MAX: $t = <$t>::MAX;
            const ONE: $t = 1;
            const THRESHOLD: $t = <$t>::MAX / 2;

            fn wrapping_sub(self, other: $t) -> $t {
                <$t>::wrapping_sub(self, other)
            }

            fn wrapping_inc(self) -> $t {
                <$t>::wrapping_add(self, 1)
            }

            fn is_zero(self) -> bool {
                self == 0
            }
        }
    )*};
}
impl_counter!(u8, u16, u32);

/// Is `x` at-or-before `y`, accounting for exactly one wraparound?
///
/// Two ids exactly `THRESHOLD` apart are not ordered either way; the protocol
///  never keeps ids that far apart alive (the resync window is much smaller).
pub fn le<T: Counter>(x: T, y: T) -> bool {
    (x <= y && y.wrapping_sub(x) < T::THRESHOLD) || (x > y && x.wrapping_sub(y) > T::THRESHOLD)
}

/// Is `x` at-or-after `y`, accounting for exactly one wraparound?
pub fn ge<T: Counter>(x: T, y: T) -> bool {
    (x >= y && x.wrapping_sub(y) < T::THRESHOLD) || (x < y && y.wrapping_sub(x) > T::THRESHOLD)
}

/// `x - y` modulo the type's range; never negative.
pub fn sub<T: Counter>(x: T, y: T) -> T {
    x.wrapping_sub(y)
}

/// Like [`sub`], but yields the type's maximum instead of 0, for call sites
///  where 0 is reserved as a "no difference" sentinel.
pub fn sub0<T: Counter>(x: T, y: T) -> T {
    let diff = x.wrapping_sub(y);
    if diff.is_zero() {
        T::MAX
    } else {
        diff
    }
}

/// `x + 1` modulo the type's range.
pub fn inc<T: Counter>(x: T) -> T {
    x.wrapping_inc()
}

/// Like [`inc`], but skips 0: incrementing the maximum yields 1.
pub fn inc0<T: Counter>(x: T) -> T {
    let next = x.wrapping_inc();
    if next.is_zero() {
        T::ONE
    } else {
        next
    }
}
