use std::sync::Arc;

use sqlx::PgPool;

use crate::core::token_cipher::TokenCipher;
use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::assignment_mapping::AssignmentMapper;
use crate::services::lms::LmsGateway;
use crate::services::storage::BlobStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    redis: RedisHandle,
    storage: Option<Arc<dyn BlobStore>>,
    lms: Arc<dyn LmsGateway>,
    mapper: AssignmentMapper,
    cipher: TokenCipher,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        redis: RedisHandle,
        storage: Option<Arc<dyn BlobStore>>,
        lms: Arc<dyn LmsGateway>,
    ) -> anyhow::Result<Self> {
        let cipher = TokenCipher::from_passphrase(settings.security().token_encryption_key())?;
        let mapper = AssignmentMapper::from_settings(&settings, db.clone(), lms.clone());

        Ok(Self {
            inner: Arc::new(InnerState { settings, db, redis, storage, lms, mapper, cipher }),
        })
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn storage(&self) -> Option<&Arc<dyn BlobStore>> {
        self.inner.storage.as_ref()
    }

    pub(crate) fn lms(&self) -> &dyn LmsGateway {
        self.inner.lms.as_ref()
    }

    pub(crate) fn mapper(&self) -> &AssignmentMapper {
        &self.inner.mapper
    }

    pub(crate) fn cipher(&self) -> &TokenCipher {
        &self.inner.cipher
    }
}
