use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use cni_args::PodIdentity;
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
    ConnectOptions,
};
use tracing::{debug, warn};

use crate::{Backend, Lease, Storage};

/// file the leases live in, under `<data_dir>/<network>/`
pub const DB_FILE: &str = "leases.db";

/// how long to wait on another plugin process holding the write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SqliteDb {
    inner: SqlitePool,
    network: String,
}

impl SqliteDb {
    /// connect to `uri` & apply migrations, e.g. `sqlite::memory:` for tests
    pub async fn new(uri: impl AsRef<str>, network: impl Into<String>) -> Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(uri.as_ref())?;
        Self::connect(opts, network.into()).await
    }

    /// open (creating if needed) the database file at `path`
    pub async fn open(path: impl Into<PathBuf>, network: impl Into<String>) -> Result<Self, sqlx::Error> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(opts, network.into()).await
    }

    async fn connect(opts: SqliteConnectOptions, network: String) -> Result<Self, sqlx::Error> {
        let opts = opts
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            // make sqlite log queries at trace level so we don't get a bloated log on `debug`
            .log_statements(tracing::log::LevelFilter::Trace);

        // one invocation is one sequential flow, a single conn is plenty
        let inner = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        // two plugin processes creating the same fresh db can race on the
        // migrations table, the loser tries once more
        let mut attempts = 0;
        loop {
            match sqlx::migrate!().run(&inner).await {
                Ok(()) => break,
                Err(err) => {
                    attempts += 1;
                    if attempts <= 1 {
                        warn!(?err, "error running migrations-- retrying");
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(Self { inner, network })
    }
}

/// Opens `<data_dir>/<network>/leases.db`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

#[async_trait]
impl Backend for SqliteBackend {
    type Store = SqliteDb;

    async fn open(&self, network: &str, data_dir: &Path) -> Result<SqliteDb, sqlx::Error> {
        let path = data_dir.join(network).join(DB_FILE);
        debug!(?path, "opening lease store");
        SqliteDb::open(path, network).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    ip: String,
    range_id: i64,
    container_id: String,
    if_name: String,
    pod_ns: String,
    pod_name: String,
}

impl TryFrom<LeaseRow> for Lease {
    type Error = sqlx::Error;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        Ok(Lease {
            ip: util::parse_ip(&row.ip)?,
            range_id: row.range_id as usize,
            container_id: row.container_id,
            if_name: row.if_name,
            pod: PodIdentity {
                namespace: row.pod_ns,
                name: row.pod_name,
            },
        })
    }
}

#[async_trait]
impl Storage for SqliteDb {
    type Error = sqlx::Error;

    /// insert the lease & move the range's last reserved address to it. The
    /// primary key on (network, ip) & the unique owner index turn a conflict
    /// into zero rows inserted.
    async fn reserve(&self, lease: &Lease) -> Result<bool, Self::Error> {
        // TRANSACTION START
        let mut tx = self.inner.begin().await?;
        let inserted = sqlx::query(
            r#"INSERT OR IGNORE INTO leases
            (network, ip, range_id, container_id, if_name, pod_ns, pod_name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )
        .bind(&self.network)
        .bind(lease.ip.to_string())
        .bind(lease.range_id as i64)
        .bind(&lease.container_id)
        .bind(&lease.if_name)
        .bind(&lease.pod.namespace)
        .bind(&lease.pod.name)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if inserted {
            sqlx::query(
                r#"INSERT INTO last_reserved (network, range_id, ip) VALUES (?1, ?2, ?3)
                ON CONFLICT(network, range_id) DO UPDATE SET ip = excluded.ip"#,
            )
            .bind(&self.network)
            .bind(lease.range_id as i64)
            .bind(lease.ip.to_string())
            .execute(&mut *tx)
            .await?;
        }
        // TRANSACTION COMMIT
        tx.commit().await?;
        Ok(inserted)
    }

    async fn last_reserved_ip(&self, range_id: usize) -> Result<Option<IpAddr>, Self::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT ip FROM last_reserved WHERE network = ?1 AND range_id = ?2",
        )
        .bind(&self.network)
        .bind(range_id as i64)
        .fetch_optional(&self.inner)
        .await?
        .map(|ip| util::parse_ip(&ip))
        .transpose()
    }

    async fn get_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error> {
        sqlx::query_as::<_, LeaseRow>(
            r#"SELECT ip, range_id, container_id, if_name, pod_ns, pod_name FROM leases
            WHERE network = ?1 AND container_id = ?2 AND if_name = ?3 AND range_id = ?4"#,
        )
        .bind(&self.network)
        .bind(container_id)
        .bind(if_name)
        .bind(range_id as i64)
        .fetch_optional(&self.inner)
        .await?
        .map(Lease::try_from)
        .transpose()
    }

    async fn find_by_id(&self, container_id: &str, if_name: &str) -> Result<bool, Self::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM leases WHERE network = ?1 AND container_id = ?2 AND if_name = ?3",
        )
        .bind(&self.network)
        .bind(container_id)
        .bind(if_name)
        .fetch_one(&self.inner)
        .await?;
        Ok(count > 0)
    }

    async fn find_by_pod(
        &self,
        pod: &PodIdentity,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error> {
        sqlx::query_as::<_, LeaseRow>(
            r#"SELECT ip, range_id, container_id, if_name, pod_ns, pod_name FROM leases
            WHERE network = ?1 AND pod_ns = ?2 AND pod_name = ?3 AND if_name = ?4 AND range_id = ?5
            LIMIT 1"#,
        )
        .bind(&self.network)
        .bind(&pod.namespace)
        .bind(&pod.name)
        .bind(if_name)
        .bind(range_id as i64)
        .fetch_optional(&self.inner)
        .await?
        .map(Lease::try_from)
        .transpose()
    }

    async fn rebind(
        &self,
        ip: IpAddr,
        range_id: usize,
        container_id: &str,
        if_name: &str,
    ) -> Result<bool, Self::Error> {
        let updated = sqlx::query(
            r#"UPDATE leases SET container_id = ?1, if_name = ?2
            WHERE network = ?3 AND ip = ?4 AND range_id = ?5"#,
        )
        .bind(container_id)
        .bind(if_name)
        .bind(&self.network)
        .bind(ip.to_string())
        .bind(range_id as i64)
        .execute(&self.inner)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn release_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<u64, Self::Error> {
        Ok(sqlx::query(
            r#"DELETE FROM leases
            WHERE network = ?1 AND container_id = ?2 AND if_name = ?3 AND range_id = ?4"#,
        )
        .bind(&self.network)
        .bind(container_id)
        .bind(if_name)
        .bind(range_id as i64)
        .execute(&self.inner)
        .await?
        .rows_affected())
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

mod util {
    use std::net::IpAddr;

    /// addresses are stored in their canonical text form
    pub fn parse_ip(ip: &str) -> Result<IpAddr, sqlx::Error> {
        ip.parse::<IpAddr>()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn lease(ip: &str, container_id: &str, range_id: usize) -> Lease {
        Lease {
            ip: ip.parse().unwrap(),
            range_id,
            container_id: container_id.to_owned(),
            if_name: "eth0".to_owned(),
            pod: PodIdentity::default(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reserve() {
        let db = SqliteDb::new("sqlite::memory:", "net").await.unwrap();
        assert!(db.reserve(&lease("10.0.0.2", "a", 0)).await.unwrap());
        // same address
        assert!(!db.reserve(&lease("10.0.0.2", "b", 0)).await.unwrap());
        // same owner in the same range
        assert!(!db.reserve(&lease("10.0.0.3", "a", 0)).await.unwrap());
        assert!(db.reserve(&lease("2001:db8::2", "a", 1)).await.unwrap());

        assert_eq!(
            db.last_reserved_ip(0).await.unwrap(),
            Some("10.0.0.2".parse().unwrap())
        );
        assert_eq!(
            db.last_reserved_ip(1).await.unwrap(),
            Some("2001:db8::2".parse().unwrap())
        );
        assert_eq!(db.last_reserved_ip(2).await.unwrap(), None);

        let got = db.get_by_id("a", "eth0", 1).await.unwrap().unwrap();
        assert_eq!(got, lease("2001:db8::2", "a", 1));
        assert!(db.find_by_id("a", "eth0").await.unwrap());
        assert!(!db.find_by_id("a", "eth1").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_release_and_rebind() {
        let db = SqliteDb::new("sqlite::memory:", "net").await.unwrap();
        let mut owned = lease("10.0.0.5", "old", 0);
        owned.pod = PodIdentity {
            namespace: "ns".to_owned(),
            name: "web".to_owned(),
        };
        assert!(db.reserve(&owned).await.unwrap());

        let found = db
            .find_by_pod(&owned.pod, "eth0", 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.container_id, "old");
        assert!(db.rebind(found.ip, 0, "new", "eth0").await.unwrap());
        assert!(!db.find_by_id("old", "eth0").await.unwrap());
        assert!(db.find_by_id("new", "eth0").await.unwrap());

        assert_eq!(db.release_by_id("new", "eth0", 1).await.unwrap(), 0);
        assert_eq!(db.release_by_id("new", "eth0", 0).await.unwrap(), 1);
        assert_eq!(db.release_by_id("new", "eth0", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_backend_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteBackend.open("mynet", dir.path()).await.unwrap();
        assert!(db.reserve(&lease("10.0.0.2", "a", 0)).await.unwrap());
        db.close().await;
        assert!(dir.path().join("mynet").join(DB_FILE).exists());

        let db = SqliteBackend.open("mynet", dir.path()).await.unwrap();
        assert!(db.find_by_id("a", "eth0").await.unwrap());
        assert_eq!(
            db.last_reserved_ip(0).await.unwrap(),
            Some("10.0.0.2".parse().unwrap())
        );
        db.close().await;
    }
}
