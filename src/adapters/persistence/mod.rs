use sqlx::PgPool;

pub mod audit;
pub mod idempotency;
pub mod subscription;

/// Postgres implementation of the store traits. One struct implements all
/// of them so a single pool (and, inside `commit_transition`, a single
/// transaction) backs every store.
#[derive(Clone)]
pub struct PostgresPersistence {
    pub(crate) pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
