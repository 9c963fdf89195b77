//! Host-side memcpy redundancy
//!
//! Measures how much of a host-visible copy moved bytes the destination
//! already held. Large buffers are compared in parallel.

use rayon::prelude::*;

/// Below this length the parallel split costs more than it saves
const PAR_SEQ_LEN: usize = 1 << 20;

/// Count the destination bytes that already equal their source byte.
///
/// Compares over the common prefix of the two slices.
pub fn compute_memcpy_redundancy(dst: &[u8], src: &[u8]) -> u64 {
    let len = dst.len().min(src.len());
    let (dst, src) = (&dst[..len], &src[..len]);

    if len >= PAR_SEQ_LEN {
        dst.par_iter().zip(src.par_iter()).filter(|(d, s)| d == s).count() as u64
    } else {
        dst.iter().zip(src.iter()).filter(|(d, s)| d == s).count() as u64
    }
}

/// Count redundant bytes and copy every differing byte from `src` to `dst`.
///
/// Equivalent to performing the memcpy while measuring it; bytes past the
/// common prefix are left untouched.
pub fn patch_memcpy_redundancy(dst: &mut [u8], src: &[u8]) -> u64 {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let patch = |(d, s): (&mut u8, &u8)| -> u64 {
        if d == s {
            1
        } else {
            *d = *s;
            0
        }
    };

    if len >= PAR_SEQ_LEN {
        dst.par_iter_mut().zip(src.par_iter()).map(patch).sum()
    } else {
        dst.iter_mut().zip(src.iter()).map(patch).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_redundancy() {
        let dst = [1u8, 2, 3, 4];
        let src = [1u8, 9, 3, 9];
        assert_eq!(compute_memcpy_redundancy(&dst, &src), 2);
    }

    #[test]
    fn test_compute_uneven_lengths() {
        let dst = [1u8, 2, 3];
        let src = [1u8, 2, 3, 4, 5];
        assert_eq!(compute_memcpy_redundancy(&dst, &src), 3);
        assert_eq!(compute_memcpy_redundancy(&src, &dst), 3);
    }

    #[test]
    fn test_patch_copies_differing_bytes() {
        let mut dst = [1u8, 0, 3, 0, 9];
        let src = [1u8, 2, 3, 4];
        let same = patch_memcpy_redundancy(&mut dst, &src);
        assert_eq!(same, 2);
        assert_eq!(dst, [1, 2, 3, 4, 9]);
    }

    #[test]
    fn test_parallel_path() {
        let src = vec![0xabu8; PAR_SEQ_LEN + 17];
        let mut dst = src.clone();
        dst[0] = 0;
        dst[PAR_SEQ_LEN] = 0;
        assert_eq!(
            compute_memcpy_redundancy(&dst, &src),
            (PAR_SEQ_LEN + 17 - 2) as u64
        );
        let same = patch_memcpy_redundancy(&mut dst, &src);
        assert_eq!(same, (PAR_SEQ_LEN + 17 - 2) as u64);
        assert_eq!(dst, src);
    }
}
