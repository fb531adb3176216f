use crate::{
    config::Config,
    error::{AppError, Result},
    models::{bookmark::{Bookmark, NewBookmark}, realtime::RowFilter},
    services::{auth::SessionHandle, supabase::SupabaseClient},
};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 排序方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    fn as_query_value(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.descending { "desc" } else { "asc" }
        )
    }
}

/// 书签查询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkQuery {
    pub filter: Option<RowFilter>,
    pub order: OrderBy,
}

impl BookmarkQuery {
    /// Every row visible to the session, newest first.
    pub fn newest_first() -> Self {
        Self {
            filter: None,
            order: OrderBy::desc("created_at"),
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// 书签存储接口
///
/// Implementations must enforce owner isolation themselves: the caller's
/// filters are never a security boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn query(&self, query: &BookmarkQuery) -> Result<Vec<Bookmark>>;

    async fn insert(&self, row: NewBookmark) -> Result<Bookmark>;

    async fn delete(&self, filter: &RowFilter) -> Result<()>;
}

/// PostgREST 数据服务客户端
#[derive(Clone)]
pub struct RestStore {
    client: SupabaseClient,
    session: SessionHandle,
    schema: String,
    table: String,
}

impl RestStore {
    pub fn new(config: &Config, session: SessionHandle) -> Result<Self> {
        Ok(Self::with_client(
            SupabaseClient::new(config)?,
            session,
            &config.bookmarks_schema,
            &config.bookmarks_table,
        ))
    }

    pub fn with_client(client: SupabaseClient, session: SessionHandle, schema: &str, table: &str) -> Self {
        Self {
            client,
            session,
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    fn table_url(&self) -> Result<url::Url> {
        self.client.endpoint(&format!("rest/v1/{}", self.table))
    }

    /// Request against the table, in the configured schema.
    fn table_request(&self, method: Method, url: url::Url) -> reqwest::RequestBuilder {
        let token = self.session.access_token();
        let mut request = self.client.request(method.clone(), url, token.as_deref());
        if self.schema != "public" {
            let header = if method == Method::GET {
                "Accept-Profile"
            } else {
                "Content-Profile"
            };
            request = request.header(header, &self.schema);
        }
        request
    }
}

#[async_trait]
impl BookmarkStore for RestStore {
    async fn query(&self, query: &BookmarkQuery) -> Result<Vec<Bookmark>> {
        let mut url = self.table_url()?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            if let Some(filter) = &query.filter {
                let (column, value) = filter.as_query_pair();
                pairs.append_pair(&column, &value);
            }
            pairs.append_pair("order", &query.order.as_query_value());
        }

        let response = self.table_request(Method::GET, url).send().await?;
        let rows: Option<Vec<Bookmark>> = SupabaseClient::check(response).await?.json().await?;
        let rows = rows.unwrap_or_default();

        debug!("Fetched {} bookmarks from {}", rows.len(), self.table);
        Ok(rows)
    }

    async fn insert(&self, row: NewBookmark) -> Result<Bookmark> {
        let url = self.table_url()?;
        let response = self
            .table_request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;

        let mut created: Vec<Bookmark> = SupabaseClient::check(response).await?.json().await?;
        if created.is_empty() {
            return Err(AppError::internal("Insert returned no row"));
        }
        let created = created.remove(0);

        info!("Created bookmark {} for user {}", created.id, created.owner_id);
        Ok(created)
    }

    async fn delete(&self, filter: &RowFilter) -> Result<()> {
        let mut url = self.table_url()?;
        {
            let (column, value) = filter.as_query_pair();
            url.query_pairs_mut().append_pair(&column, &value);
        }

        let response = self
            .table_request(Method::DELETE, url)
            .header("Prefer", "return=minimal")
            .send()
            .await?;
        SupabaseClient::check(response).await?;

        info!("Deleted bookmarks where {}", filter);
        Ok(())
    }
}
