//! One repository struct per collection, §4.C-§4.J, plus the shared
//! migration ledger and the SQL helpers every repository builds on.

pub mod alerts;
pub mod author_works;
pub mod changes;
pub mod content_index;
pub mod migrations;
pub mod pages;
pub mod queue;
pub mod retention;
pub mod sessions;
pub mod sites;
pub mod sitemaps;
pub mod util;

pub use alerts::AlertsRepository;
pub use author_works::{AuthorWorksRepository, DuplicateCandidate};
pub use changes::ChangesRepository;
pub use content_index::ContentIndexRepository;
pub use pages::PagesRepository;
pub use queue::QueueRepository;
pub use retention::{ArchiveSink, FsArchiveSink, MaintenanceReport, RetentionRepository, RetentionStatusEntry};
pub use sessions::SessionsRepository;
pub use sites::SitesRepository;
pub use sitemaps::SiteMapsRepository;

use crate::config::RetentionConfig;
use crate::storage::pool::DbPool;

/// Every collection repository bound to one pool, handed to callers (the
/// maintenance CLI, a crawler process) as a single unit.
#[derive(Clone)]
pub struct Repositories {
    pub sites: SitesRepository,
    pub pages: PagesRepository,
    pub sessions: SessionsRepository,
    pub queue: QueueRepository,
    pub changes: ChangesRepository,
    pub alerts: AlertsRepository,
    pub content_index: ContentIndexRepository,
    pub sitemaps: SiteMapsRepository,
    pub author_works: AuthorWorksRepository,
    pub retention: RetentionRepository,
}

impl Repositories {
    pub fn new(pool: DbPool, retention_config: RetentionConfig) -> Self {
        Self {
            sites: SitesRepository::new(pool.clone()),
            pages: PagesRepository::new(pool.clone()),
            sessions: SessionsRepository::new(pool.clone()),
            queue: QueueRepository::new(pool.clone()),
            changes: ChangesRepository::new(pool.clone()),
            alerts: AlertsRepository::new(pool.clone()),
            content_index: ContentIndexRepository::new(pool.clone()),
            sitemaps: SiteMapsRepository::new(pool.clone()),
            author_works: AuthorWorksRepository::new(pool.clone()),
            retention: RetentionRepository::new(pool, retention_config),
        }
    }
}
