pub mod backups;
pub mod migrate;
pub mod unlock;
