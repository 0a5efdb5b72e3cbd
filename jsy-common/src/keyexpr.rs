use crate::error::{Error, Result};

/// Default key expression prefix for all meter telemetry.
pub const KEY_PREFIX: &str = "jsy";

/// Builder for the bridge's key expressions.
///
/// Readings live at `<prefix>/<meter>/<channel path>`, bridge metadata under
/// `<prefix>/@/...`.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for one channel of one meter.
    ///
    /// ```
    /// use jsy_common::keyexpr::KeyExprBuilder;
    ///
    /// let key = KeyExprBuilder::default().reading("main-panel", "phase_a/voltage");
    /// assert_eq!(key, "jsy/main-panel/phase_a/voltage");
    /// ```
    pub fn reading(&self, meter: &str, channel: &str) -> String {
        format!("{}/{}/{}", self.prefix, meter, channel)
    }

    /// Wildcard matching every channel of a meter.
    pub fn meter_wildcard(&self, meter: &str) -> String {
        format!("{}/{}/**", self.prefix, meter)
    }

    /// Key for a meter's availability record.
    ///
    /// ```
    /// use jsy_common::keyexpr::KeyExprBuilder;
    ///
    /// let key = KeyExprBuilder::default().liveness("main-panel");
    /// assert_eq!(key, "jsy/@/meters/main-panel/liveness");
    /// ```
    pub fn liveness(&self, meter: &str) -> String {
        format!("{}/@/meters/{}/liveness", self.prefix, meter)
    }

    pub fn status(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

/// A reading key split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyExpr {
    pub meter: String,
    pub channel: String,
}

/// Parse `<prefix>/<meter>/<channel path>`.
///
/// Metadata keys (`<prefix>/@/...`) are rejected.
pub fn parse_reading_key(prefix: &str, key: &str) -> Result<ParsedKeyExpr> {
    let rest = key
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| Error::KeyExpr(key.to_string()))?;

    let (meter, channel) = rest
        .split_once('/')
        .ok_or_else(|| Error::KeyExpr(key.to_string()))?;

    if meter.is_empty() || meter == "@" || channel.is_empty() {
        return Err(Error::KeyExpr(key.to_string()));
    }

    Ok(ParsedKeyExpr {
        meter: meter.to_string(),
        channel: channel.to_string(),
    })
}
