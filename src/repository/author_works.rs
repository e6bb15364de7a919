//! Author/work store, §3 "AuthorWork". `work_id` is globally unique when
//! present; `(author, title, page_id's site)` is only a duplicate-candidate
//! key surfaced as a warning, never a rejection.

use rusqlite::{params, Row};

use crate::error::Result;
use crate::ids::new_id;
use crate::models::AuthorWork;
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, now, to_rfc3339};

fn row_to_work(row: &Row<'_>) -> rusqlite::Result<AuthorWork> {
    Ok(AuthorWork {
        id: row.get::<_, String>("id")?.parse().unwrap_or_else(|_| new_id()),
        author: row.get("author")?,
        title: row.get("title")?,
        page_id: row
            .get::<_, Option<String>>("page_id")?
            .and_then(|s| s.parse().ok()),
        composed_astronomical_year: row.get("composed_astronomical_year")?,
        period: row.get("period")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub existing_id: uuid::Uuid,
    pub author: String,
    pub title: String,
}

#[derive(Clone)]
pub struct AuthorWorksRepository {
    pool: DbPool,
}

impl AuthorWorksRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts the work unconditionally. If an existing row shares
    /// `(author, title)`, the id is returned alongside the new one rather
    /// than blocking the insert — callers decide whether to act on it.
    #[tracing::instrument(skip(self), fields(collection = "author_works", op = "create_author_work"))]
    pub async fn create_author_work(
        &self,
        work: crate::models::AuthorWorkCreate,
    ) -> Result<(uuid::Uuid, Option<DuplicateCandidate>)> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let work = work.clone();
            async move {
                let now_str = to_rfc3339(now());
                pool.with_conn(move |conn| {
                    let duplicate: Option<(String, String, String)> = conn
                        .query_row(
                            "SELECT id, author, title FROM author_works WHERE author = ?1 AND title = ?2 LIMIT 1",
                            params![work.author, work.title],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        )
                        .optional_none_ok()?;

                    let id = new_id();
                    conn.execute(
                        "INSERT INTO author_works (id, author, title, page_id, composed_astronomical_year, period, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        params![
                            id.to_string(),
                            work.author,
                            work.title,
                            work.page_id.map(|p| p.to_string()),
                            work.composed_astronomical_year,
                            work.period,
                            now_str,
                        ],
                    )?;

                    let candidate = duplicate.map(|(existing_id, author, title)| DuplicateCandidate {
                        existing_id: existing_id.parse().unwrap_or_else(|_| new_id()),
                        author,
                        title,
                    });
                    Ok((id, candidate))
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "author_works", op = "get_works_by_author"))]
    pub async fn get_works_by_author(&self, author: &str) -> Result<Vec<AuthorWork>> {
        let pool = self.pool.clone();
        let author = author.to_string();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let author = author.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM author_works WHERE author = ?1 COLLATE NOCASE ORDER BY composed_astronomical_year ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![author], row_to_work)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "author_works", op = "get_works_in_period"))]
    pub async fn get_works_in_period(
        &self,
        from_astronomical_year: i32,
        to_astronomical_year: i32,
    ) -> Result<Vec<AuthorWork>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM author_works
                         WHERE composed_astronomical_year BETWEEN ?1 AND ?2
                         ORDER BY composed_astronomical_year ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![from_astronomical_year, to_astronomical_year], row_to_work)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await
            }
        })
        .await
    }
}

/// `query_row` turns "no rows" into `QueryReturnedNoRows`; this repository
/// treats that as `None` rather than an error, same as `OptionalExtension`
/// but spelled out since the closure already returns a tuple, not `Result`.
trait OptionalNoneOk<T> {
    fn optional_none_ok(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalNoneOk<T> for rusqlite::Result<T> {
    fn optional_none_ok(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthorWorkCreate;

    async fn setup() -> AuthorWorksRepository {
        let pool = DbPool::open_in_memory().unwrap();
        crate::repository::migrations::migrate(&pool).await.unwrap();
        AuthorWorksRepository::new(pool)
    }

    #[tokio::test]
    async fn duplicate_author_title_is_flagged_not_rejected() {
        let repo = setup().await;
        let (_first_id, first_dup) = repo
            .create_author_work(AuthorWorkCreate {
                author: "Spinoza".into(),
                title: "Ethics".into(),
                page_id: None,
                composed_astronomical_year: Some(1677),
                period: Some("early_modern".into()),
            })
            .await
            .unwrap();
        assert!(first_dup.is_none());

        let (second_id, second_dup) = repo
            .create_author_work(AuthorWorkCreate {
                author: "Spinoza".into(),
                title: "Ethics".into(),
                page_id: None,
                composed_astronomical_year: Some(1677),
                period: Some("early_modern".into()),
            })
            .await
            .unwrap();
        assert!(second_dup.is_some());
        assert_ne!(second_id, second_dup.unwrap().existing_id);
    }

    #[tokio::test]
    async fn works_in_period_filters_by_astronomical_year_range() {
        let repo = setup().await;
        repo.create_author_work(AuthorWorkCreate {
            author: "Plato".into(),
            title: "Republic".into(),
            page_id: None,
            composed_astronomical_year: Some(-379),
            period: Some("classical".into()),
        })
        .await
        .unwrap();
        repo.create_author_work(AuthorWorkCreate {
            author: "Descartes".into(),
            title: "Meditations".into(),
            page_id: None,
            composed_astronomical_year: Some(1641),
            period: Some("early_modern".into()),
        })
        .await
        .unwrap();

        let ancient = repo.get_works_in_period(-500, 0).await.unwrap();
        assert_eq!(ancient.len(), 1);
        assert_eq!(ancient[0].author, "Plato");
    }

    #[tokio::test]
    async fn get_works_by_author_is_case_insensitive() {
        let repo = setup().await;
        repo.create_author_work(AuthorWorkCreate {
            author: "Hume".into(),
            title: "Treatise".into(),
            page_id: None,
            composed_astronomical_year: Some(1739),
            period: None,
        })
        .await
        .unwrap();

        let found = repo.get_works_by_author("hume").await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
