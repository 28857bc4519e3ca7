use anyhow::Context;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgConnection, PgPool, Postgres, Row, Transaction,
};
use std::time::Duration;

use crate::error::{HistoryError, Result};
use crate::model::{Branch, ChildRelationship, Commit, Id, Structure};
use crate::store::traits::{BranchStore, CommitStore, Store, StructureStore};

const UNIQUE_VIOLATION: &str = "23505";
const QUERY_CANCELED: &str = "57014";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
/// Transaction-scoped advisory lock serializing writers of next edges
const EDGE_WRITER_LOCK: i64 = 0x6d69_6c6c_6572;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    transaction_timeout: Duration,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        transaction_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(transaction_timeout)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self {
            pool,
            transaction_timeout,
        })
    }

    /// Run the embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Open a transaction whose statements and lock waits are bounded by the
    /// configured timeout. Dropping it without `commit` rolls back.
    async fn begin(&self, scope: &Id) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, scope, "Failed to begin transaction"))?;

        let millis = self.transaction_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", millis))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, scope, "Failed to set statement timeout"))?;
        sqlx::query(&format!("SET LOCAL lock_timeout = {}", millis))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, scope, "Failed to set lock timeout"))?;

        Ok(tx)
    }

    async fn commit(tx: Transaction<'static, Postgres>, scope: &Id) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| classify(e, scope, "Failed to commit transaction"))
    }
}

/// Map driver errors onto the history error kinds callers can act on
fn classify(err: sqlx::Error, scope: &Id, context: &'static str) -> HistoryError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(UNIQUE_VIOLATION) => return HistoryError::DuplicateId(scope.clone()),
            Some(QUERY_CANCELED) | Some(LOCK_NOT_AVAILABLE) => {
                return HistoryError::TransactionTimeout(scope.clone())
            }
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                return HistoryError::ConcurrentUpdate(scope.clone())
            }
            _ => {}
        }
    }
    if matches!(err, sqlx::Error::PoolTimedOut) {
        return HistoryError::TransactionTimeout(scope.clone());
    }
    HistoryError::Storage(anyhow::Error::new(err).context(context))
}

fn structure_from_row(row: &PgRow) -> Result<Structure> {
    Ok(Structure {
        id: row.try_get("id").context("Failed to read structure id")?,
        name: row.try_get("name").context("Failed to read structure name")?,
        description: row
            .try_get("description")
            .context("Failed to read structure description")?,
        created_at: row
            .try_get("created_at")
            .context("Failed to read structure created_at")?,
    })
}

fn branch_from_row(row: &PgRow) -> Result<Branch> {
    Ok(Branch {
        id: row.try_get("id").context("Failed to read branch id")?,
        structure_id: row
            .try_get("structure_id")
            .context("Failed to read branch structure_id")?,
        name: row.try_get("name").context("Failed to read branch name")?,
        reason_for_branch: row
            .try_get("reason_for_branch")
            .context("Failed to read branch reason")?,
        created_at: row
            .try_get("created_at")
            .context("Failed to read branch created_at")?,
        initial_commit_id: row
            .try_get("initial_commit_id")
            .context("Failed to read branch initial_commit_id")?,
        current_commit_id: row
            .try_get("current_commit_id")
            .context("Failed to read branch current_commit_id")?,
    })
}

fn commit_from_row(row: &PgRow) -> Result<Commit> {
    Ok(Commit {
        id: row.try_get("id").context("Failed to read commit id")?,
        name: row.try_get("name").context("Failed to read commit name")?,
        commit_message: row
            .try_get("commit_message")
            .context("Failed to read commit message")?,
        created_at: row
            .try_get("created_at")
            .context("Failed to read commit created_at")?,
        digest: row.try_get("digest").context("Failed to read commit digest")?,
    })
}

fn relationship_from_row(row: &PgRow) -> Result<ChildRelationship> {
    Ok(ChildRelationship {
        id: row.try_get("id").context("Failed to read relationship id")?,
        relationship_name: row
            .try_get("relationship_name")
            .context("Failed to read relationship name")?,
        parent_commit_id: row
            .try_get("parent_commit_id")
            .context("Failed to read parent commit id")?,
        child_commit_id: row
            .try_get("child_commit_id")
            .context("Failed to read child commit id")?,
        parent_class_name: row
            .try_get("parent_class_name")
            .context("Failed to read parent class name")?,
        child_class_name: row
            .try_get("child_class_name")
            .context("Failed to read child class name")?,
        created_at: row
            .try_get("created_at")
            .context("Failed to read relationship created_at")?,
    })
}

fn ids_from_rows(rows: Vec<PgRow>, column: &str) -> Result<Vec<Id>> {
    rows.iter()
        .map(|row| {
            row.try_get::<String, _>(column)
                .with_context(|| format!("Failed to read column {}", column))
                .map_err(HistoryError::from)
        })
        .collect()
}

/// `table` is always one of the static table names below
async fn row_exists(conn: &mut PgConnection, table: &'static str, id: &Id) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)",
        table
    ))
    .bind(id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| classify(e, id, "Failed to check row existence"))?;
    Ok(exists)
}

async fn insert_structure_row(conn: &mut PgConnection, structure: &Structure) -> Result<()> {
    if row_exists(conn, "structures", &structure.id).await? {
        return Err(HistoryError::DuplicateId(structure.id.clone()));
    }
    sqlx::query(
        "INSERT INTO structures (id, name, description, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(&structure.id)
    .bind(&structure.name)
    .bind(&structure.description)
    .bind(structure.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &structure.id, "Failed to insert structure"))?;
    Ok(())
}

async fn insert_branch_row(conn: &mut PgConnection, branch: &Branch) -> Result<()> {
    if row_exists(conn, "branches", &branch.id).await? {
        return Err(HistoryError::DuplicateId(branch.id.clone()));
    }
    sqlx::query(
        r#"
        INSERT INTO branches (id, structure_id, name, reason_for_branch, created_at,
                              initial_commit_id, current_commit_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&branch.id)
    .bind(&branch.structure_id)
    .bind(&branch.name)
    .bind(&branch.reason_for_branch)
    .bind(branch.created_at)
    .bind(&branch.initial_commit_id)
    .bind(&branch.current_commit_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &branch.id, "Failed to insert branch"))?;
    Ok(())
}

async fn insert_commit_row(conn: &mut PgConnection, commit: &Commit) -> Result<()> {
    if row_exists(conn, "commits", &commit.id).await? {
        return Err(HistoryError::DuplicateId(commit.id.clone()));
    }
    sqlx::query(
        "INSERT INTO commits (id, name, commit_message, created_at, digest) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&commit.id)
    .bind(&commit.name)
    .bind(&commit.commit_message)
    .bind(commit.created_at)
    .bind(&commit.digest)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &commit.id, "Failed to insert commit"))?;
    Ok(())
}

async fn seed_rows(conn: &mut PgConnection, branch_id: &Id, commit_id: &Id) -> Result<()> {
    sqlx::query(
        "UPDATE branches SET initial_commit_id = $2, current_commit_id = $2 WHERE id = $1",
    )
    .bind(branch_id)
    .bind(commit_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, branch_id, "Failed to seed branch"))?;
    sqlx::query("INSERT INTO branch_heads (branch_id, commit_id) VALUES ($1, $2)")
        .bind(branch_id)
        .bind(commit_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, branch_id, "Failed to create head edge"))?;
    sqlx::query("INSERT INTO branch_commits (branch_id, commit_id) VALUES ($1, $2)")
        .bind(branch_id)
        .bind(commit_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, branch_id, "Failed to record branch membership"))?;
    Ok(())
}

/// Whether `target` is reachable from `from` over next edges of any branch
async fn reaches(conn: &mut PgConnection, from: &Id, target: &Id) -> Result<bool> {
    let reachable: bool = sqlx::query_scalar(
        r#"
        WITH RECURSIVE reachable(commit_id) AS (
            SELECT $1::TEXT
            UNION
            SELECT e.to_commit_id
            FROM commit_edges e
            JOIN reachable r ON e.from_commit_id = r.commit_id
            WHERE e.kind = 'next'
        )
        SELECT EXISTS (SELECT 1 FROM reachable WHERE commit_id = $2)
        "#,
    )
    .bind(from)
    .bind(target)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| classify(e, from, "Failed to walk next edges"))?;
    Ok(reachable)
}

async fn is_member(conn: &mut PgConnection, branch_id: &Id, commit_id: &Id) -> Result<bool> {
    let member: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM branch_commits WHERE branch_id = $1 AND commit_id = $2)",
    )
    .bind(branch_id)
    .bind(commit_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| classify(e, branch_id, "Failed to check branch membership"))?;
    Ok(member)
}

#[async_trait::async_trait]
impl StructureStore for PostgresStore {
    async fn get_structure(&self, id: &Id) -> Result<Option<Structure>> {
        let row = sqlx::query("SELECT id, name, description, created_at FROM structures WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch structure")?;

        row.as_ref().map(structure_from_row).transpose()
    }

    async fn list_structures(&self) -> Result<Vec<Structure>> {
        let rows = sqlx::query(
            "SELECT id, name, description, created_at FROM structures ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list structures")?;

        rows.iter().map(structure_from_row).collect()
    }

    async fn insert_structure(&self, structure: Structure) -> Result<()> {
        let mut tx = self.begin(&structure.id).await?;
        insert_structure_row(&mut tx, &structure).await?;
        Self::commit(tx, &structure.id).await
    }

    async fn insert_structure_setup(
        &self,
        structure: Structure,
        branch: Branch,
        initial_commit: Commit,
    ) -> Result<()> {
        if branch.structure_id != structure.id {
            return Err(HistoryError::Validation(format!(
                "Branch '{}' does not belong to structure '{}'",
                branch.id, structure.id
            )));
        }

        let mut tx = self.begin(&structure.id).await?;
        insert_structure_row(&mut tx, &structure).await?;
        insert_commit_row(&mut tx, &initial_commit).await?;
        insert_branch_row(&mut tx, &branch).await?;
        seed_rows(&mut tx, &branch.id, &initial_commit.id).await?;
        Self::commit(tx, &structure.id).await
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        let row = sqlx::query(
            r#"
            SELECT id, structure_id, name, reason_for_branch, created_at,
                   initial_commit_id, current_commit_id
            FROM branches
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch branch")?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn list_branches_for_structure(&self, structure_id: &Id) -> Result<Vec<Branch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, structure_id, name, reason_for_branch, created_at,
                   initial_commit_id, current_commit_id
            FROM branches
            WHERE structure_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(structure_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branches")?;

        rows.iter().map(branch_from_row).collect()
    }

    async fn insert_branch(&self, branch: Branch) -> Result<()> {
        let mut tx = self.begin(&branch.id).await?;
        if !row_exists(&mut tx, "structures", &branch.structure_id).await? {
            return Err(HistoryError::not_found("Structure", branch.structure_id));
        }
        insert_branch_row(&mut tx, &branch).await?;
        Self::commit(tx, &branch.id).await
    }

    async fn get_head(&self, branch_id: &Id) -> Result<Option<Id>> {
        let head = sqlx::query_scalar("SELECT commit_id FROM branch_heads WHERE branch_id = $1")
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch head")?;
        Ok(head)
    }

    async fn seed_branch(&self, branch_id: &Id, commit_id: &Id) -> Result<()> {
        let mut tx = self.begin(branch_id).await?;

        let initial: Option<Option<String>> =
            sqlx::query_scalar("SELECT initial_commit_id FROM branches WHERE id = $1 FOR UPDATE")
                .bind(branch_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| classify(e, branch_id, "Failed to lock branch"))?;
        let Some(initial) = initial else {
            return Err(HistoryError::not_found("Branch", branch_id.clone()));
        };
        if !row_exists(&mut tx, "commits", commit_id).await? {
            return Err(HistoryError::UnsavedCommit(commit_id.clone()));
        }
        if initial.is_some() {
            return Err(HistoryError::AlreadySeeded(branch_id.clone()));
        }

        seed_rows(&mut tx, branch_id, commit_id)
            .await
            .map_err(|e| match e {
                // A concurrent seed won the head row
                HistoryError::DuplicateId(_) => HistoryError::AlreadySeeded(branch_id.clone()),
                other => other,
            })?;
        Self::commit(tx, branch_id).await
    }

    async fn swap_head(
        &self,
        branch_id: &Id,
        expected_head: &Id,
        new_commit_id: &Id,
    ) -> Result<()> {
        let mut tx = self.begin(branch_id).await?;

        if !row_exists(&mut tx, "branches", branch_id).await? {
            return Err(HistoryError::not_found("Branch", branch_id.clone()));
        }
        if !row_exists(&mut tx, "commits", new_commit_id).await? {
            return Err(HistoryError::UnsavedCommit(new_commit_id.clone()));
        }

        // Row lock serializes concurrent advances; the loser re-reads the new head
        let current: Option<String> =
            sqlx::query_scalar("SELECT commit_id FROM branch_heads WHERE branch_id = $1 FOR UPDATE")
                .bind(branch_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| classify(e, branch_id, "Failed to lock head edge"))?;
        let current = current.ok_or_else(|| HistoryError::MissingHead(branch_id.clone()))?;
        if &current != expected_head {
            return Err(HistoryError::TransactionConflict {
                branch_id: branch_id.clone(),
                expected: expected_head.clone(),
                found: current,
            });
        }
        if is_member(&mut tx, branch_id, new_commit_id).await? {
            return Err(HistoryError::CommitAlreadyInHistory {
                branch_id: branch_id.clone(),
                commit_id: new_commit_id.clone(),
            });
        }

        // Advances on other branches may add edges between the same commits
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(EDGE_WRITER_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, branch_id, "Failed to lock edge writers"))?;
        if reaches(&mut tx, new_commit_id, expected_head).await? {
            return Err(HistoryError::CycleDetected {
                head_id: expected_head.clone(),
                commit_id: new_commit_id.clone(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO commit_edges (branch_id, from_commit_id, to_commit_id, kind)
            VALUES ($1, $2, $3, 'next'), ($1, $3, $2, 'previous')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(branch_id)
        .bind(expected_head)
        .bind(new_commit_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, branch_id, "Failed to link commits"))?;

        sqlx::query("UPDATE branch_heads SET commit_id = $2, updated_at = NOW() WHERE branch_id = $1")
            .bind(branch_id)
            .bind(new_commit_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, branch_id, "Failed to move head edge"))?;

        sqlx::query("UPDATE branches SET current_commit_id = $2 WHERE id = $1")
            .bind(branch_id)
            .bind(new_commit_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, branch_id, "Failed to move current commit"))?;

        sqlx::query("INSERT INTO branch_commits (branch_id, commit_id) VALUES ($1, $2)")
            .bind(branch_id)
            .bind(new_commit_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, branch_id, "Failed to record branch membership"))?;

        Self::commit(tx, branch_id).await
    }

    async fn set_current_commit(&self, branch_id: &Id, commit_id: &Id) -> Result<()> {
        let mut tx = self.begin(branch_id).await?;
        if !row_exists(&mut tx, "branches", branch_id).await? {
            return Err(HistoryError::not_found("Branch", branch_id.clone()));
        }
        if !is_member(&mut tx, branch_id, commit_id).await? {
            return Err(HistoryError::Validation(format!(
                "Commit '{}' is not part of branch '{}'",
                commit_id, branch_id
            )));
        }
        sqlx::query("UPDATE branches SET current_commit_id = $2 WHERE id = $1")
            .bind(branch_id)
            .bind(commit_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, branch_id, "Failed to move current commit"))?;
        Self::commit(tx, branch_id).await
    }

    async fn list_branch_commits(&self, branch_id: &Id) -> Result<Vec<Id>> {
        let rows = sqlx::query("SELECT commit_id FROM branch_commits WHERE branch_id = $1 ORDER BY seq")
            .bind(branch_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branch commits")?;
        ids_from_rows(rows, "commit_id")
    }

    async fn list_branch_next_commits(&self, branch_id: &Id, commit_id: &Id) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            r#"
            SELECT to_commit_id FROM commit_edges
            WHERE branch_id = $1 AND from_commit_id = $2 AND kind = 'next'
            ORDER BY seq
            "#,
        )
        .bind(branch_id)
        .bind(commit_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branch next commits")?;
        ids_from_rows(rows, "to_commit_id")
    }
}

#[async_trait::async_trait]
impl CommitStore for PostgresStore {
    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>> {
        let row = sqlx::query(
            "SELECT id, name, commit_message, created_at, digest FROM commits WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch commit")?;

        row.as_ref().map(commit_from_row).transpose()
    }

    async fn insert_commit(&self, commit: Commit) -> Result<()> {
        let mut tx = self.begin(&commit.id).await?;
        insert_commit_row(&mut tx, &commit).await?;
        Self::commit(tx, &commit.id).await
    }

    async fn list_next_commits(&self, id: &Id) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            r#"
            SELECT to_commit_id FROM commit_edges
            WHERE from_commit_id = $1 AND kind = 'next'
            GROUP BY to_commit_id
            ORDER BY MIN(seq)
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list next commits")?;
        ids_from_rows(rows, "to_commit_id")
    }

    async fn list_previous_commits(&self, id: &Id) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            r#"
            SELECT to_commit_id FROM commit_edges
            WHERE from_commit_id = $1 AND kind = 'previous'
            GROUP BY to_commit_id
            ORDER BY MIN(seq)
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list previous commits")?;
        ids_from_rows(rows, "to_commit_id")
    }

    async fn insert_child_relationship(&self, relationship: ChildRelationship) -> Result<()> {
        let mut tx = self.begin(&relationship.parent_commit_id).await?;
        if row_exists(&mut tx, "child_relationships", &relationship.id).await? {
            return Err(HistoryError::DuplicateId(relationship.id));
        }
        for commit_id in [&relationship.parent_commit_id, &relationship.child_commit_id] {
            if !row_exists(&mut tx, "commits", commit_id).await? {
                return Err(HistoryError::not_found("Commit", commit_id.clone()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO child_relationships (id, relationship_name, parent_commit_id, child_commit_id,
                                             parent_class_name, child_class_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&relationship.id)
        .bind(&relationship.relationship_name)
        .bind(&relationship.parent_commit_id)
        .bind(&relationship.child_commit_id)
        .bind(&relationship.parent_class_name)
        .bind(&relationship.child_class_name)
        .bind(relationship.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, &relationship.id, "Failed to insert child relationship"))?;

        Self::commit(tx, &relationship.parent_commit_id).await
    }

    async fn list_child_relationships(
        &self,
        parent_commit_id: &Id,
    ) -> Result<Vec<ChildRelationship>> {
        let rows = sqlx::query(
            r#"
            SELECT id, relationship_name, parent_commit_id, child_commit_id,
                   parent_class_name, child_class_name, created_at
            FROM child_relationships
            WHERE parent_commit_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(parent_commit_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list child relationships")?;

        rows.iter().map(relationship_from_row).collect()
    }
}

impl Store for PostgresStore {}
