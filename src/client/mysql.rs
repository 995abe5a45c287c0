//! MySQL connector backed by `mysql_async`

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts};
use tracing::debug;

use super::{ClientError, Connector};

/// Opens plain `mysql_async` connections from a `mysql://` URL
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Connection = Conn;

    async fn open(&self, target: &str) -> Result<Conn, ClientError> {
        let opts = Opts::from_url(target)?;
        debug!(
            host = %opts.ip_or_hostname(),
            port = opts.tcp_port(),
            database = ?opts.db_name(),
            "Opening MySQL connection"
        );
        let conn = Conn::new(opts).await?;
        Ok(conn)
    }

    async fn ping(&self, conn: &mut Conn) -> Result<(), ClientError> {
        conn.ping().await?;
        Ok(())
    }

    async fn close(&self, conn: Conn) -> Result<(), ClientError> {
        conn.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_rejects_non_mysql_url() {
        let connector = MySqlConnector::new();
        let result = connector.open("postgres://localhost/db").await;
        assert!(result.is_err());
    }
}
