use crate::connection::config::RepositoryConfig;
use crate::hook::HooksManager;
use crate::querier::Querier;
use crate::schema::Schema;
use std::sync::Arc;

/// Everything the application registers at startup, handed explicitly to
/// the repository and reachable from every connection.
pub struct ApplicationContext {
    config: RepositoryConfig,
    schema: Schema,
    hooks: HooksManager,
    querier: Arc<dyn Querier>,
}

impl ApplicationContext {
    pub fn new(
        config: RepositoryConfig,
        schema: Schema,
        hooks: HooksManager,
        querier: Arc<dyn Querier>,
    ) -> Self {
        Self {
            config,
            schema,
            hooks,
            querier,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn hooks(&self) -> &HooksManager {
        &self.hooks
    }

    pub fn querier(&self) -> &Arc<dyn Querier> {
        &self.querier
    }
}
