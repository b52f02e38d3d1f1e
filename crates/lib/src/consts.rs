pub const APP_NAME: &str = "strata";

/// Length of the truncated hex hash used in store directory names.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Default plan file name looked up in the working directory.
pub const PLAN_FILENAME: &str = "strata.toml";

/// Marker written next to a frozen stage tree.
pub const STAGE_COMPLETE_MARKER: &str = ".strata-complete";

/// Runtime manifest file written by the runtime stage.
pub const RUNTIME_MANIFEST_FILENAME: &str = "runtime.json";

/// Value for `SOURCE_DATE_EPOCH` in every stage command.
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// PATH handed to stage commands unless the config overrides it.
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
