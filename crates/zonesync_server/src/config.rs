//! Server configuration.

/// Configuration for the record service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest page a zone fetch returns, whatever the caller asks for.
    pub max_fetch_page: usize,
    /// Largest page of the database feed.
    pub max_database_page: usize,
    /// Maximum records accepted by one save request.
    pub max_push_batch: usize,
    /// Maximum identifiers accepted by one delete request.
    pub max_delete_batch: usize,
}

impl ServerConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_fetch_page: 200,
            max_database_page: 50,
            max_push_batch: 100,
            max_delete_batch: 100,
        }
    }

    /// Sets the maximum zone fetch page.
    pub fn with_max_fetch_page(mut self, size: usize) -> Self {
        self.max_fetch_page = size;
        self
    }

    /// Sets the maximum database feed page.
    pub fn with_max_database_page(mut self, size: usize) -> Self {
        self.max_database_page = size;
        self
    }

    /// Sets the maximum save batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the maximum delete batch size.
    pub fn with_max_delete_batch(mut self, size: usize) -> Self {
        self.max_delete_batch = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
