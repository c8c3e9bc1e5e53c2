use std::time::SystemTime;

use anyhow::{anyhow, Result};
use ulid::Generator;

/// Produces `<prefix>-<ULID>` identifiers. ULIDs from one generator are
/// strictly increasing, so lexical order of the ids is creation order.
pub struct StageIdGenerator {
    inner: Generator,
}

impl Default for StageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl StageIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Generator::new(),
        }
    }

    pub fn next_id(&mut self, prefix: &str, at: SystemTime) -> Result<String> {
        let ulid = self
            .inner
            .generate_from_datetime(at)
            .map_err(|err| anyhow!("failed generating stage id: {err}"))?;
        Ok(format!("{prefix}-{ulid}"))
    }
}
