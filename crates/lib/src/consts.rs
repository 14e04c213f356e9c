//! Names and constants shared across the crate.

pub const APP_NAME: &str = "kiln";

/// Metadata file written into every store entry after a successful build or unpack.
pub const PKG_INFO_FILENAME: &str = ".pkg-info.json";

/// Reserved archive entry holding the JSON info record.
pub const CAR_INFO_ENTRY: &str = ".car-info.json";

/// Reserved archive entry holding the raw ed25519 signature.
pub const CAR_SIGNATURE_ENTRY: &str = "~signature";

/// Symlink inside a store directory pointing at the store it is layered on.
pub const STORE_PARENT_LINK: &str = "_parent";

/// Lock file guarding a store directory.
pub const STORE_LOCK_FILENAME: &str = ".lock";

/// Default worker count for the substitution pass.
pub const DEFAULT_SUBSTITUTE_CONCURRENCY: usize = 20;

/// Repository label used when none is configured.
pub const DEFAULT_REPO: &str = "local";

/// January 1, 1980 00:00:00 UTC (ZIP epoch), exported as `SOURCE_DATE_EPOCH` to builds.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Search path appended after dependency `bin/` directories in build environments.
pub const BASE_BUILD_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
