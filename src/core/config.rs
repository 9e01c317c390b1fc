use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Base directory served to the mesh. Created if absent.
    pub base: PathBuf,
    /// Peer to prefer as source when set. While set, `get` does not
    /// short-circuit on local presence.
    pub head: Option<String>,
    /// Enable the background hash index.
    pub hash: bool,
}

impl Config {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            head: None,
            hash: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("./files")
    }
}
