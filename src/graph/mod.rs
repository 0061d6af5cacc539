//! Remote API interaction module
//!
//! Thin transport over the OData-flavored REST API: request execution,
//! error body parsing and URL construction. Token acquisition happens
//! outside the engine; the client is handed a bearer token.
//!
//! # Module Structure
//!
//! - [`client`] - Main client for making API requests
//! - [`http`] - HTTP utilities for REST API calls
//!
//! # Example
//!
//! ```ignore
//! use graphrecon::graph::{GraphClient, GraphHttpClient};
//!
//! async fn example() -> graphrecon::Result<()> {
//!     let http = GraphHttpClient::new(std::time::Duration::from_secs(30), "graphrecon")?;
//!     let client = GraphClient::new("https://graph.microsoft.com/beta", "token", http)?;
//!     let scripts = client.get("/deviceManagement/deviceManagementScripts").await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod http;

pub use client::{join_uri, GraphClient};
pub use http::{describe_error, GraphHttpClient};
