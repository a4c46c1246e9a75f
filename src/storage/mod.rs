pub mod blob;
pub mod db;

pub use blob::BlobStore;
pub use db::Database;
