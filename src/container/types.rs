use serde::{Deserialize, Serialize};

/// A running container as reported by the container collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Runtime container id, the registry key
    pub id: String,
    /// Any process of the container, used to enter its namespaces
    pub pid: u32,
    /// Network namespace inode
    pub netns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mntns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Container {
    pub fn new(id: impl Into<String>, pid: u32, netns: u64) -> Self {
        Self {
            id: id.into(),
            pid,
            netns,
            mntns: None,
            name: None,
        }
    }

    pub fn with_mntns(mut self, mntns: u64) -> Self {
        self.mntns = Some(mntns);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
