//! Namespaced 64-bit ids: namespace in the high 32 bits, local id in the low.

#[inline]
pub const fn namespaced_id(namespace_id: u32, local_id: u32) -> i64 {
    ((namespace_id as u64) << 32 | local_id as u64) as i64
}

#[inline]
pub const fn namespace_id(id: i64) -> u32 {
    ((id as u64) >> 32) as u32
}

#[inline]
pub const fn local_id(id: i64) -> u32 {
    id as u64 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_namespace_and_local() {
        let id = namespaced_id(1, 11);
        assert_eq!(id, 0x0000_0001_0000_000b);
        assert_eq!(namespace_id(id), 1);
        assert_eq!(local_id(id), 11);
    }

    #[test]
    fn high_namespace_bits_survive() {
        let id = namespaced_id(u32::MAX, 7);
        assert!(id < 0);
        assert_eq!(namespace_id(id), u32::MAX);
        assert_eq!(local_id(id), 7);
    }
}
