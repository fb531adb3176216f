use std::sync::Arc;

use tracing::info;

use crate::{
    config::{Backend, Config},
    error::{AppError, Result},
    services::{
        auth::{AuthProvider, SessionHandle, SupabaseAuth},
        database::{BookmarkStore, RestStore},
        memory::{MemoryClient, MemoryPlatform},
        realtime::ChangeFeed,
    },
};

/// 平台连接
/// 认证、数据、变更通知三个服务共享同一个会话
#[derive(Clone)]
pub struct Platform {
    /// 认证服务
    pub auth: Arc<dyn AuthProvider>,

    /// 书签数据服务
    pub store: Arc<dyn BookmarkStore>,

    /// 变更通知服务
    pub feed: Arc<dyn ChangeFeed>,
}

impl Platform {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn BookmarkStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { auth, store, feed }
    }

    /// One client of an in-process platform.
    pub fn memory(client: MemoryClient) -> Self {
        let client = Arc::new(client);
        Self {
            auth: client.clone(),
            store: client.clone(),
            feed: client,
        }
    }

    /// A connection to the configured Supabase project.
    pub async fn supabase(config: &Config) -> Result<Self> {
        let session = match &config.session_file {
            Some(path) => SessionHandle::persisted(path).await,
            None => SessionHandle::new(),
        };

        let auth = SupabaseAuth::new(config, session.clone())?;
        let store = RestStore::new(config, session.clone())?;
        let feed = Self::realtime(config, session)?;

        Ok(Self::new(Arc::new(auth), Arc::new(store), feed))
    }

    #[cfg(feature = "websocket")]
    fn realtime(config: &Config, session: SessionHandle) -> Result<Arc<dyn ChangeFeed>> {
        Ok(Arc::new(crate::services::realtime::RealtimeService::new(
            config, session,
        )?))
    }

    #[cfg(not(feature = "websocket"))]
    fn realtime(_config: &Config, _session: SessionHandle) -> Result<Arc<dyn ChangeFeed>> {
        Err(AppError::Config(
            "Supabase backend requires the `websocket` feature".to_string(),
        ))
    }
}

/// 应用程序的共享状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<Config>,

    /// 平台连接
    pub platform: Platform,

    /// 内存后端时的平台本身，用于演示登录
    pub demo: Option<MemoryPlatform>,
}

impl AppState {
    pub async fn from_config(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let (platform, demo) = match config.backend {
            Backend::Supabase => {
                info!("Connecting to Supabase project at {}", config.supabase_url);
                (Platform::supabase(&config).await?, None)
            }
            Backend::Memory => {
                info!("Using in-memory platform");
                let demo = MemoryPlatform::new(&config.bookmarks_schema, &config.bookmarks_table);
                (Platform::memory(demo.client()), Some(demo))
            }
        };

        Ok(Self {
            config: Arc::new(config),
            platform,
            demo,
        })
    }

    pub fn is_demo(&self) -> bool {
        self.demo.is_some()
    }
}
