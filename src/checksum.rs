use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, ErrorKind, Result};

const CHUNK_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// Parse an algorithm name. Java-style names used by Maven lockfiles
    /// ("SHA-256", "MD5") are normalized to the canonical lower-case form.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::new(
                ErrorKind::InvalidChecksum,
                format!("unsupported checksum algorithm: {name}"),
            )
            .with_solution("Supported algorithms: md5, sha1, sha224, sha256, sha384, sha512.")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An (algorithm, hex digest) pair as found in a lockfile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChecksumInfo {
    pub algorithm: Algorithm,
    pub hexdigest: String,
}

impl ChecksumInfo {
    pub fn new(algorithm: Algorithm, hexdigest: impl Into<String>) -> Result<Self> {
        let hexdigest: String = hexdigest.into();
        if hexdigest.is_empty() || !hexdigest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::new(
                ErrorKind::InvalidChecksum,
                format!("invalid {algorithm} digest: {hexdigest:?} is not a hex string"),
            ));
        }
        Ok(Self {
            algorithm,
            hexdigest: hexdigest.to_ascii_lowercase(),
        })
    }

    pub fn from_parts(algorithm_name: &str, hexdigest: &str) -> Result<Self> {
        Self::new(Algorithm::from_name(algorithm_name)?, hexdigest)
    }
}

impl fmt::Display for ChecksumInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hexdigest)
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => Self::Md5(Md5::new()),
            Algorithm::Sha1 => Self::Sha1(Sha1::new()),
            Algorithm::Sha224 => Self::Sha224(Sha224::new()),
            Algorithm::Sha256 => Self::Sha256(Sha256::new()),
            Algorithm::Sha384 => Self::Sha384(Sha384::new()),
            Algorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => format!("{:x}", h.finalize()),
            Self::Sha1(h) => format!("{:x}", h.finalize()),
            Self::Sha224(h) => format!("{:x}", h.finalize()),
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Sha384(h) => format!("{:x}", h.finalize()),
            Self::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Compute the digests for every algorithm in `algorithms`, streaming the
/// file exactly once.
fn compute_digests(path: &Path, algorithms: &[Algorithm]) -> Result<Vec<ChecksumInfo>> {
    let mut file = File::open(path).map_err(|source| {
        Error::invalid_input(format!(
            "failed to open {} for checksum verification: {source}",
            path.display()
        ))
    })?;

    let mut hashers: Vec<(Algorithm, Hasher)> = algorithms
        .iter()
        .map(|algorithm| (*algorithm, Hasher::new(*algorithm)))
        .collect();

    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(|source| {
            Error::invalid_input(format!("failed to read {}: {source}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        for (_, hasher) in &mut hashers {
            hasher.update(&buffer[..read]);
        }
    }

    hashers
        .into_iter()
        .map(|(algorithm, hasher)| ChecksumInfo::new(algorithm, hasher.finalize_hex()))
        .collect()
}

pub fn compute(path: &Path, algorithm: Algorithm) -> Result<ChecksumInfo> {
    let mut digests = compute_digests(path, &[algorithm])?;
    Ok(digests.remove(0))
}

/// Verify that the file matches at least one of the expected checksums. The
/// file is streamed once no matter how many algorithms are involved.
///
/// Callers must never pass an empty expected set: whether a dependency is
/// allowed to lack checksums is a resolver-level policy decision, settled
/// before verification is requested.
pub fn must_match_any(path: &Path, expected: &[ChecksumInfo]) -> Result<ChecksumInfo> {
    debug_assert!(
        !expected.is_empty(),
        "must_match_any requires at least one expected checksum"
    );

    let mut algorithms: Vec<Algorithm> = expected.iter().map(|info| info.algorithm).collect();
    algorithms.sort_unstable();
    algorithms.dedup();

    let computed = compute_digests(path, &algorithms)?;
    for info in expected {
        if computed.contains(info) {
            return Ok(info.clone());
        }
    }

    let expected_list = expected
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let computed_list = computed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::new(
        ErrorKind::ChecksumVerificationFailed,
        format!(
            "checksum mismatch for {}: expected any of [{expected_list}], got [{computed_list}]",
            path.display()
        ),
    )
    .with_solution(
        "The downloaded artifact does not match the lockfile. \
         Regenerate the lockfile or investigate the download source.",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sample(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("sample.txt");
        std::fs::write(&path, b"airlock").expect("write sample");
        path
    }

    #[test]
    fn normalizes_java_algorithm_names() {
        assert_eq!(
            Algorithm::from_name("SHA-256").expect("parse"),
            Algorithm::Sha256
        );
        assert_eq!(Algorithm::from_name("MD5").expect("parse"), Algorithm::Md5);
        assert_eq!(
            Algorithm::from_name("sha512").expect("parse"),
            Algorithm::Sha512
        );
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = Algorithm::from_name("crc32").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidChecksum);
    }

    #[test]
    fn rejects_non_hex_digest() {
        let err = ChecksumInfo::new(Algorithm::Sha256, "not-hex!").expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidChecksum);
    }

    #[test]
    fn digest_is_lowercased() {
        let info = ChecksumInfo::new(Algorithm::Sha256, "DEADBEEF").expect("checksum info");
        assert_eq!(info.hexdigest, "deadbeef");
    }

    #[test]
    fn match_any_accepts_single_correct_digest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sample(&temp);
        let expected = ChecksumInfo::new(Algorithm::Sha256, compute_sha256_of_sample()).expect("info");

        let matched = must_match_any(&path, std::slice::from_ref(&expected)).expect("match");
        assert_eq!(matched, expected);
    }

    #[test]
    fn match_any_accepts_when_one_of_many_matches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sample(&temp);

        let wrong = ChecksumInfo::new(Algorithm::Md5, "d41d8cd98f00b204e9800998ecf8427e")
            .expect("wrong info");
        let right =
            ChecksumInfo::new(Algorithm::Sha256, compute_sha256_of_sample()).expect("right info");

        let matched = must_match_any(&path, &[wrong, right.clone()]).expect("match any");
        assert_eq!(matched, right);
    }

    #[test]
    fn match_any_failure_lists_expected_digests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sample(&temp);
        let wrong = ChecksumInfo::new(Algorithm::Sha256, "deadbeef").expect("info");

        let err = must_match_any(&path, &[wrong]).expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::ChecksumVerificationFailed);
        assert!(err.reason().contains("sha256:deadbeef"));
    }

    fn compute_sha256_of_sample() -> String {
        let digest = Sha256::digest(b"airlock");
        format!("{digest:x}")
    }

    #[test]
    fn compute_matches_known_vector() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sample(&temp);
        let info = compute(&path, Algorithm::Sha256).expect("compute");
        assert_eq!(info.hexdigest, compute_sha256_of_sample());
    }
}
