/// 64-bit finalizer of MurmurHash3, used as the mixing function for all
/// hashed k-mer lookups.
#[inline]
pub fn murmur_hash3(key: u64) -> u64 {
    let mut k = key;
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

/// Splits an encoded k-mer into the bases at even and at odd positions,
/// each re-packed at 2 bits per base. Position 0 is the first base.
pub fn parity_halves(kmer: u64, k: usize) -> (u64, u64) {
    let mut even = 0u64;
    let mut odd = 0u64;
    for i in 0..k {
        let code = (kmer >> (2 * (k - 1 - i))) & 0b11;
        if i % 2 == 0 {
            even = (even << 2) | code;
        } else {
            odd = (odd << 2) | code;
        }
    }
    (even, odd)
}
