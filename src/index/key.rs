use std::fmt::Debug;

/// Index key: a totally ordered value with a fixed-width on-page encoding.
///
/// The tree compares decoded keys through `Ord`, so the encoding only has
/// to round-trip; it does not need to be order-preserving as raw bytes.
pub trait IndexKey: Copy + Ord + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const ENCODED_LEN: usize;

    fn encode_into(&self, buf: &mut [u8]);

    fn decode_from(buf: &[u8]) -> Self;
}

macro_rules! impl_index_key_for_int {
    ($($t:ty),*) => {
        $(
            impl IndexKey for $t {
                const ENCODED_LEN: usize = std::mem::size_of::<$t>();

                fn encode_into(&self, buf: &mut [u8]) {
                    buf[..Self::ENCODED_LEN].copy_from_slice(&self.to_le_bytes());
                }

                fn decode_from(buf: &[u8]) -> Self {
                    <$t>::from_le_bytes(buf[..Self::ENCODED_LEN].try_into().unwrap())
                }
            }
        )*
    };
}

impl_index_key_for_int!(u32, u64, i32, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_keys_round_trip() {
        let mut buf = [0u8; 8];

        42u32.encode_into(&mut buf);
        assert_eq!(u32::decode_from(&buf), 42);

        (-7i64).encode_into(&mut buf);
        assert_eq!(i64::decode_from(&buf), -7);

        u64::MAX.encode_into(&mut buf);
        assert_eq!(u64::decode_from(&buf), u64::MAX);
    }
}
