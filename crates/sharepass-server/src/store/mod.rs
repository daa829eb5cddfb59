pub mod audit;
pub mod crypto;
pub mod db;
pub mod model;

pub use audit::{AuditEvent, AuditQuery};
pub use db::{Redemption, Store};
pub use model::{NewSecret, SecretMeta, SecretRecord};
