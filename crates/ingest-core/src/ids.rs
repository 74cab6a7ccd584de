use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(TaskId);

/// The only presubmit system runs are joined from.
pub const PRESUBMIT_SYSTEM_CV: &str = "luci-cv";

/// Identity of one build: the build service host plus its numeric id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId {
    pub host: String,
    pub id: i64,
}

impl BuildId {
    pub fn new(host: impl Into<String>, id: i64) -> Self {
        Self { host: host.into(), id }
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.id)
    }
}

/// Identity of a presubmit run, e.g. `{system: "luci-cv", id: "chromium/8000-1-abcd"}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PresubmitRunId {
    pub system: String,
    pub id: String,
}

impl PresubmitRunId {
    pub fn cv(project: &str, run_id: &str) -> Self {
        Self {
            system: PRESUBMIT_SYSTEM_CV.to_string(),
            id: format!("{project}/{run_id}"),
        }
    }
}

impl fmt::Display for PresubmitRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.id)
    }
}

/// Key of an analyzed test variant within one realm.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestVariantKey {
    pub test_id: String,
    pub variant_hash: String,
}

impl TestVariantKey {
    pub fn new(test_id: impl Into<String>, variant_hash: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            variant_hash: variant_hash.into(),
        }
    }
}
