//! Build fingerprint.
//!
//! The `server.version` gauge publishes the leading 24 bits of the build
//! SHA so a fleet dashboard can tell at a glance which build every process
//! runs. A SHA that does not parse is a build-system failure and the
//! server refuses to start.

use crate::error::ServerError;

/// Git SHA baked in at compile time via `GANTRY_BUILD_SHA`, with a
/// fallback for local builds.
pub const BUILD_SHA: &str = match option_env!("GANTRY_BUILD_SHA") {
    Some(sha) => sha,
    None => "df9bf33a78c115770057e0eb836c1ad364a6cba6",
};

/// Crate version string for human-facing output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// First 24 bits of the build SHA as an integer, for the version gauge.
pub fn fingerprint() -> Result<u64, ServerError> {
    fingerprint_of(BUILD_SHA)
}

fn fingerprint_of(sha: &str) -> Result<u64, ServerError> {
    let lead = sha.get(..6).ok_or_else(|| ServerError::BadBuildSha(sha.to_owned()))?;
    u64::from_str_radix(lead, 16).map_err(|_| ServerError::BadBuildSha(sha.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_sha_parses() {
        assert!(fingerprint().is_ok());
    }

    #[test]
    fn leading_24_bits_are_extracted() {
        assert_eq!(fingerprint_of("df9bf33a78").unwrap(), 0xdf9bf3);
    }

    #[test]
    fn short_or_garbage_shas_are_fatal() {
        assert!(matches!(
            fingerprint_of("df9"),
            Err(ServerError::BadBuildSha(_))
        ));
        assert!(matches!(
            fingerprint_of("not-hex-at-all"),
            Err(ServerError::BadBuildSha(_))
        ));
    }
}
