use std::fs::File;
use std::path::Path;

use env_logger::{Env, Target};

use crate::error::Result;

/// Installs the process logger. `RUST_LOG` overrides the default `info` filter;
/// with a log file every record goes there instead of stderr.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = File::create(path)?;
        builder.target(Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
