use sqlx::{Any, AnyConnection, AnyPool, Transaction};

// ============================================================================
// Unit of Work - explicit transaction handle
// ============================================================================
//
// Every write that must commit atomically with other writes (outbox rows,
// versioned transitions, connection records, subscriptions) takes a
// `&mut UnitOfWork`. Nothing in this crate opens a transaction implicitly:
// an operation handed a committed or rolled-back handle fails with
// `StoreError::NoActiveTransaction`.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("operation requires an active transaction")]
    NoActiveTransaction,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("{type_name} event has no subject")]
    MissingSubject { type_name: &'static str },
}

pub struct UnitOfWork {
    tx: Option<Transaction<'static, Any>>,
}

impl UnitOfWork {
    pub async fn begin(pool: &AnyPool) -> Result<Self, StoreError> {
        let tx = pool.begin().await?;
        Ok(Self { tx: Some(tx) })
    }

    /// A handle with no transaction behind it
    pub fn closed() -> Self {
        Self { tx: None }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Connection of the open transaction
    pub fn connection(&mut self) -> Result<&mut AnyConnection, StoreError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(StoreError::NoActiveTransaction),
        }
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.rollback().await?;
        Ok(())
    }
}
