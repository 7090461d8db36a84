use crate::config::NodeConfig;

/// Registration handle for the virtual file system backing this node's
/// databases. The embedding SQL engine registers it under [`Self::name`];
/// the node only carries the identity through.
#[derive(Debug, Clone)]
pub struct Vfs {
    name: String,
}

impl Vfs {
    pub(crate) fn new(config: &NodeConfig) -> Self {
        Self {
            name: format!("replidb-{}", config.id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
