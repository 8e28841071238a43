//! parley-http
//!
//! The admin boundary: wallet/expert/user CRUD and health over HTTP, plus
//! the signed-event authorization tokens (request-bound kind 27235 and
//! domain-scoped kind 27236) carried in `Authorization: Nostr <base64>`.

pub mod auth;
pub mod db;
pub mod server;

pub use auth::{build_domain_token, build_request_token, verify_auth_header};
pub use db::{AdminDb, ExpertRow, UserRow, WalletRow};
pub use server::{AllowAll, AppState, CheckPerms, HttpServer, Perms};
