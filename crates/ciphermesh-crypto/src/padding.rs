use zeroize::Zeroize;

/// Bucket sizes for length-hiding padding. A padded frame is never smaller
/// than the smallest bucket that fits `2 + plaintext.len()`; if the
/// plaintext plus its length prefix exceeds the largest bucket, the frame
/// is left unpadded beyond that.
pub const BUCKETS: &[usize] = &[
    128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// Pad `plaintext` into `[2-byte BE length][plaintext][random filler]`,
/// sized to the smallest bucket that fits, or exactly `2 + len` if that
/// exceeds every bucket.
pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let needed = 2 + plaintext.len();
    let bucket = BUCKETS
        .iter()
        .copied()
        .find(|&b| b >= needed)
        .unwrap_or(needed);

    let mut out = vec![0u8; bucket];
    out[0..2].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());
    out[2..2 + plaintext.len()].copy_from_slice(plaintext);
    if bucket > needed {
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut out[needed..bucket]);
    }
    out
}

/// Recover the original plaintext from a padded frame, or `None` if the
/// frame is too short or declares a length that doesn't fit.
pub fn unpad(padded: &[u8]) -> Option<Vec<u8>> {
    if padded.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if 2 + len > padded.len() {
        return None;
    }
    Some(padded[2..2 + len].to_vec())
}

/// Like [`unpad`], but wipes the input buffer after extracting the
/// plaintext, so the padded/ciphertext-adjacent scratch space doesn't
/// linger with a readable copy of the message.
pub fn secure_unpad(padded: &mut [u8]) -> Option<Vec<u8>> {
    let result = unpad(padded);
    padded.zeroize();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_various_sizes() {
        for len in [0usize, 1, 126, 127, 254, 1022, 40_000, 65_535] {
            let plaintext = vec![0xABu8; len];
            let padded = pad(&plaintext);
            assert_eq!(unpad(&padded).unwrap(), plaintext);
        }
    }

    #[test]
    fn pads_to_smallest_fitting_bucket() {
        let plaintext = vec![0u8; 100];
        let padded = pad(&plaintext);
        assert_eq!(padded.len(), 128);
    }

    #[test]
    fn exceeds_largest_bucket_is_unpadded() {
        let plaintext = vec![0u8; 40_000];
        let padded = pad(&plaintext);
        assert_eq!(padded.len(), 2 + plaintext.len());
    }

    #[test]
    fn too_short_rejected() {
        assert_eq!(unpad(&[0u8]), None);
    }

    #[test]
    fn declared_length_overflow_rejected() {
        let mut bogus = vec![0u8; 10];
        bogus[0..2].copy_from_slice(&1000u16.to_be_bytes());
        assert_eq!(unpad(&bogus), None);
    }

    #[test]
    fn secure_unpad_wipes_input() {
        let plaintext = b"hush".to_vec();
        let mut padded = pad(&plaintext);
        let result = secure_unpad(&mut padded);
        assert_eq!(result, Some(plaintext));
        assert!(padded.iter().all(|&b| b == 0));
    }
}
