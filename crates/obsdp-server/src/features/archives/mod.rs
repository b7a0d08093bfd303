pub mod commands;

pub use commands::UploadArchiveCommand;
