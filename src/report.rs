//! Renders probe results as indented JSON.
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::logger::Logger;

pub struct Reporter {
    logger: Arc<dyn Logger>,
}

impl Reporter {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }

    /// Serializes `data` as JSON indented by two spaces.
    pub fn to_json<T: Serialize + ?Sized>(&self, data: &T) -> serde_json::Result<Vec<u8>> {
        let rendered = serde_json::to_vec_pretty(data);
        match &rendered {
            Ok(bytes) => self.logger.debug("Report rendered", &[("bytes", &bytes.len())]),
            Err(e) => self.logger.error("Report rendering failed", &[("error", e)]),
        }
        rendered
    }
}

/// Serializes a [`Duration`] as fractional milliseconds.
pub fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}
