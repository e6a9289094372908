//! Capability vocabulary shared by model clients and the router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Something a model can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    TextGen,
    Vision,
    Embedding,
    ToolUse,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::TextGen,
        Capability::Vision,
        Capability::Embedding,
        Capability::ToolUse,
    ];

    /// Stable name used in storage and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextGen => "TEXT_GEN",
            Capability::Vision => "VISION",
            Capability::Embedding => "EMBEDDING",
            Capability::ToolUse => "TOOL_USE",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "TEXT_GEN" | "TEXT" => Ok(Capability::TextGen),
            "VISION" => Ok(Capability::Vision),
            "EMBEDDING" | "EMBED" => Ok(Capability::Embedding),
            "TOOL_USE" | "TOOLS" => Ok(Capability::ToolUse),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// Parse a comma-separated capability list, ignoring duplicates.
pub fn parse_capability_list(s: &str) -> Result<Vec<Capability>, String> {
    let mut caps = Vec::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let cap: Capability = part.parse()?;
        if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    caps.sort();
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!("text-gen".parse::<Capability>().unwrap(), Capability::TextGen);
        assert!("telepathy".parse::<Capability>().is_err());
    }

    #[test]
    fn test_parse_list() {
        let caps = parse_capability_list("vision, TEXT_GEN,vision").unwrap();
        assert_eq!(caps, vec![Capability::TextGen, Capability::Vision]);
    }

    #[test]
    fn test_serde_uses_storage_names() {
        let json = serde_json::to_string(&Capability::ToolUse).unwrap();
        assert_eq!(json, "\"TOOL_USE\"");
    }
}
