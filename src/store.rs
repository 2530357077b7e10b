pub mod harvest;
pub mod models;
pub mod provider;
pub mod schema;

pub use harvest::{HarvestStore, InsertOutcome, PgHarvestStore};
pub use models::{ScrapedArticle, SessionRow};
pub use provider::{PgStore, StoreError};
