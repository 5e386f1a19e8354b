pub mod commit;
pub mod errors;
pub mod ids;
pub mod persistence;

pub use commit::{Commit, CommitsLoad};
pub use errors::{DbError, StoreError};
pub use ids::CommitId;
pub use persistence::{Persistence, PersistenceSession};
