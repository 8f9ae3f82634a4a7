/// Widening casts that cannot lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: frame length should have been checked against the configured maximum")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_cast_u32_to_usize() {
        let n: usize = u32::MAX.safe_cast();
        assert_eq!(n, 4_294_967_295);
    }

    #[test]
    fn test_prechecked_cast_in_range() {
        let n: u32 = 1234usize.prechecked_cast();
        assert_eq!(n, 1234);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).prechecked_cast();
    }
}
