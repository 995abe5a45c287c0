//! Database client seam
//!
//! The pool never talks to a database directly. It opens, verifies and closes
//! connections through a [`Connector`], so the MySQL driver can be swapped for
//! an in-memory fake in tests.

pub mod mysql;

use async_trait::async_trait;

pub use mysql::MySqlConnector;

/// Error returned by a [`Connector`] operation
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Opens, verifies and closes connections for the pool
///
/// Every failure of these three operations is treated the same way by the
/// pool: as a failure to connect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection handle handed to `execute` callbacks
    type Connection: Send + 'static;

    /// Open a new connection to `target`
    async fn open(&self, target: &str) -> Result<Self::Connection, ClientError>;

    /// Check that an open connection is alive
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), ClientError>;

    /// Close a connection
    async fn close(&self, conn: Self::Connection) -> Result<(), ClientError>;
}
