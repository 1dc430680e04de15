//! Environment variable source: VDFS prefix with __ separator

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

/// Add environment variable overlay to builder.
/// Keys look like `VDFS__FLUSH_PERIOD_SECS` or `VDFS__LOGGING__LEVEL`.
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let builder = builder.add_source(
        Environment::with_prefix("VDFS")
            .separator("__")
            .try_parsing(true),
    );
    Ok(builder)
}
