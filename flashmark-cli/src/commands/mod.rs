pub mod init;
pub mod models;
pub mod show;
pub mod sync;
