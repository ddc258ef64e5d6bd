pub mod backup;
pub mod canonical;
pub mod checkpoint;
pub mod files;
pub mod lock;
pub mod paths;
