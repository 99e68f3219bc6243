/// Widening casts that can never lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}
