//! Content and perceptual hashing primitives.

use image_hasher::{HashAlg, HasherConfig};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Fast 64-bit content hash over the raw file bytes (xxh3). Cheap enough
/// to run on every file; collisions are caught by strong-hash confirmation.
pub fn fast_hash(path: &Path) -> std::io::Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.digest())
}

/// Strong 256-bit content hash, computed lazily when grouping wants
/// exact-bucket confirmation.
pub fn strong_hash(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerceptualHashes {
    pub phash: u64,
    pub dhash: u64,
    pub ahash: u64,
}

/// The three 64-bit perceptual hashes: DCT-mean (pHash), gradient (dHash)
/// and mean-threshold (aHash), each over an 8x8 grid.
pub fn perceptual_hashes(img: &image::DynamicImage) -> PerceptualHashes {
    let phash_hasher = HasherConfig::new()
        .hash_size(8, 8)
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .to_hasher();
    let dhash_hasher = HasherConfig::new()
        .hash_size(8, 8)
        .hash_alg(HashAlg::Gradient)
        .to_hasher();
    let ahash_hasher = HasherConfig::new()
        .hash_size(8, 8)
        .hash_alg(HashAlg::Mean)
        .to_hasher();

    PerceptualHashes {
        phash: bytes_to_u64(phash_hasher.hash_image(img).as_bytes()),
        dhash: bytes_to_u64(dhash_hasher.hash_image(img).as_bytes()),
        ahash: bytes_to_u64(ahash_hasher.hash_image(img).as_bytes()),
    }
}

fn bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Hamming distance: population count of the XOR. Satisfies the triangle
/// inequality, which the BK-tree pruning bound relies on.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn gradient_image(w: u32, h: u32, invert: bool) -> DynamicImage {
        let buf = image::GrayImage::from_fn(w, h, |x, _| {
            let v = (x * 255 / w.max(1)) as u8;
            image::Luma([if invert { 255 - v } else { v }])
        });
        DynamicImage::ImageLuma8(buf)
    }

    #[test]
    fn fast_hash_is_content_determined() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        std::fs::write(&c, b"other bytes").unwrap();

        assert_eq!(fast_hash(&a).unwrap(), fast_hash(&b).unwrap());
        assert_ne!(fast_hash(&a).unwrap(), fast_hash(&c).unwrap());
    }

    #[test]
    fn strong_hash_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        // SHA-256 of the empty input.
        assert_eq!(
            strong_hash(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn identical_images_hash_identically() {
        let a = gradient_image(64, 64, false);
        let b = gradient_image(64, 64, false);
        assert_eq!(perceptual_hashes(&a), perceptual_hashes(&b));
    }

    #[test]
    fn dissimilar_images_hash_differently() {
        let a = perceptual_hashes(&gradient_image(64, 64, false));
        let b = perceptual_hashes(&gradient_image(64, 64, true));
        assert!(hamming_distance(a.dhash, b.dhash) > 0);
    }

    #[test]
    fn hamming_distance_counts_bits() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0, 1), 1);
        assert_eq!(hamming_distance(0b1010, 0b0101), 4);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }
}
