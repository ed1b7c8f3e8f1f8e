//! Standard APIs we use everywhere.

pub use std::path::{Path, PathBuf};

#[allow(unused_imports)]
pub use anyhow::{Context as _, Result, anyhow};
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
pub use serde_json::{Value, json};
#[allow(unused_imports)]
pub use tracing::{debug, error, info, instrument, trace, warn};

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = serde_json::Map<String, Value>;
